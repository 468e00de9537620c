//! Device registry: the thin host-facing glue that turns a parsed [`Config`]
//! into a set of running devices (spec.md §1 calls the real registration
//! machinery out of scope; this is the minimal in-process stand-in a
//! library needs to be usable at all).

use crate::config::{device_name, Config};
use crate::device::Device;
use crate::error::{PmbdError, Result};

pub struct Registry {
    devices: Vec<Device>,
}

impl Registry {
    pub fn load(spec: &str) -> Result<Self> {
        crate::logging::init_tracing();
        let config = crate::config::parse(spec)?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let mut devices = Vec::with_capacity(config.devices.len());
        for (index, device_cfg) in config.devices.into_iter().enumerate() {
            devices.push(Device::new(index, device_cfg)?);
        }
        Ok(Self { devices })
    }

    pub fn device(&self, index: usize) -> Result<&Device> {
        self.devices.get(index).ok_or(PmbdError::NoSuchDevice(index))
    }

    pub fn device_by_name(&self, name: &str) -> Result<&Device> {
        for (i, _) in self.devices.iter().enumerate() {
            if device_name(i) == name {
                return self.device(i);
            }
        }
        Err(PmbdError::NoSuchDevice(usize::MAX))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Statistics dump (spec.md §6 introspection surface).
    pub fn stats_dump(&self) -> serde_json::Value {
        serde_json::json!({
            "devices": self.devices.iter().enumerate().map(|(i, d)| serde_json::json!({
                "name": device_name(i),
                "stats": d.stats_snapshot(),
            })).collect::<Vec<_>>(),
        })
    }

    /// Configuration dump: every parsed clause plus derived per-device state
    /// (spec.md §6 introspection surface).
    pub fn config_dump(&self) -> serde_json::Value {
        serde_json::json!({
            "devices": self.devices.iter().enumerate().map(|(i, d)| {
                let cfg = d.config();
                serde_json::json!({
                    "name": device_name(i),
                    "capacity_sectors": cfg.capacity_sectors,
                    "pmap": cfg.pmap,
                    "nts": cfg.nts,
                    "ntl": cfg.ntl,
                    "honor_flush": cfg.honor_flush,
                    "honor_fua": cfg.honor_fua,
                    "write_protect": cfg.write_protect,
                    "wp_mode": format!("{:?}", cfg.wp_mode),
                    "wrverify": cfg.wrverify,
                    "checksum": cfg.checksum,
                    "subupdate": cfg.subupdate,
                    "lock_enabled": cfg.lock_enabled,
                    "mergeable": cfg.mergeable,
                    "rd_pause_cycles": cfg.rd_pause_cycles,
                    "wr_pause_cycles": cfg.wr_pause_cycles,
                    "buf_size_mib": cfg.buf_size_mib,
                    "buf_num": cfg.buf_num,
                    "buf_stride": cfg.buf_stride,
                    "batch": cfg.batch,
                })
            }).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_and_names_devices() {
        let registry = Registry::load("pmbd<1,1>").unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.device_by_name("pmbda").is_ok());
        assert!(registry.device_by_name("pmbdb").is_ok());
        assert!(registry.device_by_name("pmbdz").is_err());
    }
}
