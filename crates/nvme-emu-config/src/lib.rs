// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TOML description of an emulated NVMe controller and the block backend
//! which provides its single namespace.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Model number reported when the configuration does not name one.
pub const DEFAULT_MODEL: &str = "Emulated NVMe Ctrl";

/// Queue count (admin queue included) when none is configured.
pub const DEFAULT_NUM_QUEUES: u32 = 64;

/// Top-level configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub controller: Controller,
    pub backend: Backend,
}

/// Controller identity and geometry.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Controller {
    /// Serial number, at most 20 ASCII bytes.
    pub serial: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Total number of queue pairs, including the admin pair.
    #[serde(default = "default_num_queues")]
    pub num_queues: u32,

    /// Size of the Controller Memory Buffer in MiB. Zero disables it.
    #[serde(default)]
    pub cmb_size_mb: u32,

    /// Identifier folded into the subsystem NQN. Generated when absent.
    #[serde(default)]
    pub uuid: Option<Uuid>,

    #[serde(default)]
    pub vendor_id: Option<u16>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_num_queues() -> u32 {
    DEFAULT_NUM_QUEUES
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, Copy)]
pub struct BlockOpts {
    pub block_size: Option<u32>,
    pub read_only: Option<bool>,
    pub write_cache: Option<bool>,
}

/// The block backend behind the namespace.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Backend {
    /// Volatile, zero-filled storage of `size` bytes.
    Memory {
        size: u64,
        #[serde(flatten)]
        opts: BlockOpts,
    },
    /// An existing file or device node.
    File {
        path: PathBuf,
        workers: Option<NonZeroUsize>,
        #[serde(flatten)]
        opts: BlockOpts,
    },
}

impl Backend {
    pub fn opts(&self) -> &BlockOpts {
        match self {
            Backend::Memory { opts, .. } | Backend::File { opts, .. } => opts,
        }
    }
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str::<Config>(s)?)
    }
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    contents.parse()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let config = Config {
            controller: Controller {
                serial: "deadbeef".to_string(),
                model: default_model(),
                num_queues: 8,
                cmb_size_mb: 2,
                uuid: Some(Uuid::from_u128(0x1234)),
                vendor_id: None,
            },
            backend: Backend::Memory {
                size: 1 << 20,
                opts: BlockOpts { block_size: Some(512), ..Default::default() },
            },
        };
        let serialized = toml::ser::to_string(&config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn parse_defaults() {
        let raw = r#"
[controller]
serial = "nvme0"

[backend]
type = "memory"
size = 1048576
"#;
        let cfg: Config = raw.parse().unwrap();
        assert_eq!(cfg.controller.serial, "nvme0");
        assert_eq!(cfg.controller.model, DEFAULT_MODEL);
        assert_eq!(cfg.controller.num_queues, DEFAULT_NUM_QUEUES);
        assert_eq!(cfg.controller.cmb_size_mb, 0);
        assert!(cfg.controller.uuid.is_none());
        assert_eq!(
            cfg.backend,
            Backend::Memory { size: 1 << 20, opts: BlockOpts::default() }
        );
    }

    #[test]
    fn parse_file_backend() {
        let raw = r#"
[controller]
serial = "nvme1"
num_queues = 4
cmb_size_mb = 1

[backend]
type = "file"
path = "/var/tmp/disk.img"
workers = 2
read_only = true
write_cache = false
"#;
        let cfg: Config = raw.parse().unwrap();
        assert_eq!(cfg.controller.num_queues, 4);
        assert_eq!(cfg.controller.cmb_size_mb, 1);
        match &cfg.backend {
            Backend::File { path, workers, opts } => {
                assert_eq!(path, &PathBuf::from("/var/tmp/disk.img"));
                assert_eq!(workers.map(NonZeroUsize::get), Some(2));
                assert_eq!(opts.read_only, Some(true));
                assert_eq!(opts.write_cache, Some(false));
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn missing_serial_rejected() {
        let raw = r#"
[controller]
model = "nope"

[backend]
type = "memory"
size = 4096
"#;
        assert!(matches!(raw.parse::<Config>(), Err(ParseError::Toml(_))));
    }
}
