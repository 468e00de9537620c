//! Configuration: a flat, semicolon-separated clause string parsed once at
//! load into an immutable [`Config`] (spec.md §6, §9 "Global parsed
//! configuration" design note — an immutable value built once, rather than
//! process-wide mutable globals).

use crate::emulate::EmulationMode;
use crate::protect::WriteProtectMode;

use crate::error::{PmbdError, Result};

/// PM page cache attribute (spec.md §4.8 fence policy depends on this).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAttr {
    WriteBack,
    WriteCombining,
    UncachedMinus,
    UncachedStrong,
}

/// Whether write-back caching uses non-temporal stores or explicit cacheline
/// flush to make writes visible — affects the barrier fence policy
/// (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBackFlush {
    NonTemporalStore,
    CachelineFlush,
    Neither,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub capacity_sectors: u64,
    pub hm_offset_gib: u64,
    pub hm_size_gib: u64,
    pub pmap: bool,
    pub nts: bool,
    pub ntl: bool,
    pub honor_flush: bool,
    pub honor_fua: bool,
    pub cache: CacheAttr,
    pub write_back_flush: WriteBackFlush,
    pub write_protect: bool,
    pub wp_mode: WriteProtectMode,
    pub wrverify: bool,
    pub checksum: bool,
    pub subupdate: bool,
    /// `lock<Y/N>` (default Y): whether per-PBN serialization is honored.
    /// The core always serializes access through `PbiTable` regardless of
    /// this flag — disabling it would violate the crate's own per-PBN
    /// invariant (spec.md §3, §8) — so `N` is accepted and recorded for
    /// the config dump but never actually lifts the lock. See DESIGN.md.
    pub lock_enabled: bool,
    /// `mgb<Y/N>` (default Y): whether adjacent scatter-gather segments may
    /// be merged into a single request before it reaches the dispatcher
    /// (spec.md §6 "Merge predicate").
    pub mergeable: bool,
    /// `rdpause<n,...>` / `wrpause<n,...>` (cycles per page, default 0): a
    /// fixed per-copy delay injected independent of the latency/bandwidth
    /// emulation modes (spec.md §6).
    pub rd_pause_cycles: u64,
    pub wr_pause_cycles: u64,
    pub buf_size_mib: u64,
    pub buf_num: usize,
    pub buf_stride: u64,
    pub batch: usize,
    pub read_mode: EmulationMode,
    pub write_mode: EmulationMode,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub devices: Vec<DeviceConfig>,
    /// `adj<n>` (nanoseconds, default 0): parsed and carried for the config
    /// dump, matching the original driver's own `g_pmbd_adjust_ns` — which
    /// is set by the parser but never read by any emulation path in
    /// `pmbd.c` either. Kept inert here for the same reason, recorded in
    /// DESIGN.md rather than guessed into a behavior the source doesn't have.
    pub adj_ns: u64,
}

/// Devices are named by index using a short ordinal suffix (spec.md §6;
/// up to 26 devices, `a`..`z`).
pub fn device_name(index: usize) -> String {
    let suffix = (b'a' + (index % 26) as u8) as char;
    format!("pmbd{suffix}")
}

/// Parse the semicolon-separated clause string into an immutable [`Config`].
pub fn parse(spec: &str) -> Result<Config> {
    let mut clauses: Vec<(&str, &str)> = Vec::new();
    for clause in spec.split(';') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        if let Some(idx) = clause.find('<') {
            let name = &clause[..idx];
            let body = if clause.ends_with('>') {
                &clause[idx + 1..clause.len() - 1]
            } else {
                &clause[idx + 1..]
            };
            clauses.push((name, body));
        } else {
            clauses.push((clause, ""));
        }
    }

    if clauses.iter().any(|(n, _)| *n == "rammode") {
        return Err(PmbdError::ConfigInvalid(
            "rammode is a reserved option with no defined behavior".into(),
        ));
    }

    let (_, pmbd_body) = clauses
        .iter()
        .find(|(n, _)| *n == "pmbd")
        .ok_or_else(|| PmbdError::ConfigInvalid("missing required `pmbd<...>` clause".into()))?;
    let capacities_gib = parse_u64_list(pmbd_body)?;
    let num_devices = capacities_gib.len();
    if num_devices == 0 {
        return Err(PmbdError::ConfigInvalid("pmbd<...> declared zero devices".into()));
    }
    if num_devices > 26 {
        return Err(PmbdError::ConfigInvalid("at most 26 devices are supported".into()));
    }

    let pmap = bool_clause(&clauses, "pmap", false)?;
    let nts = bool_clause(&clauses, "nts", false)?;
    let ntl = bool_clause(&clauses, "ntl", false)?;
    let honor_flush = bool_clause(&clauses, "wb", true)?;
    let honor_fua = bool_clause(&clauses, "fua", true)?;
    let write_protect = bool_clause(&clauses, "wrprot", false)?;
    let wrverify = bool_clause(&clauses, "wrverify", false)?;
    let checksum = bool_clause(&clauses, "checksum", false)?;
    let subupdate = bool_clause(&clauses, "subupdate", false)?;
    let clflush = bool_clause(&clauses, "clflush", false)?;
    let lock_enabled = bool_clause(&clauses, "lock", true)?;
    let mergeable = bool_clause(&clauses, "mgb", true)?;
    let adj_ns = u64_clause(&clauses, "adj", 0)?;

    let cache = match string_clause(&clauses, "cache").as_deref() {
        Some("WB") | None => CacheAttr::WriteBack,
        Some("WC") => CacheAttr::WriteCombining,
        Some("UM") => CacheAttr::UncachedMinus,
        Some("UC") => CacheAttr::UncachedStrong,
        Some(other) => {
            return Err(PmbdError::ConfigInvalid(format!("unknown cache attribute `{other}`")))
        }
    };

    let write_back_flush = match (nts, clflush) {
        (true, _) => WriteBackFlush::NonTemporalStore,
        (false, true) => WriteBackFlush::CachelineFlush,
        (false, false) => WriteBackFlush::Neither,
    };

    if pmap && write_protect {
        return Err(PmbdError::ConfigInvalid(
            "pmap<Y> is incompatible with wrprot<Y>: private mapping requires wrprotN".into(),
        ));
    }

    let wp_modes = int_list_broadcast(&clauses, "wpmode", num_devices, 0)?;
    let buf_sizes_mib = int_list_broadcast(&clauses, "bufsize", num_devices, 4096)?;
    let buf_num = usize_clause(&clauses, "bufnum", 1)?;
    let buf_stride = u64_clause(&clauses, "bufstride", 1024)?;
    let batches = int_list_broadcast(&clauses, "batch", num_devices, 1024)?;

    let rd_lats = int_list_broadcast(&clauses, "rdlat", num_devices, 0)?;
    let wr_lats = int_list_broadcast(&clauses, "wrlat", num_devices, 0)?;
    let rd_bws = int_list_broadcast(&clauses, "rdbw", num_devices, 0)?;
    let wr_bws = int_list_broadcast(&clauses, "wrbw", num_devices, 0)?;
    let rd_sxs = float_list_broadcast(&clauses, "rdsx", num_devices, 1.0)?;
    let wr_sxs = float_list_broadcast(&clauses, "wrsx", num_devices, 1.0)?;
    let sim_modes = int_list_broadcast(&clauses, "simmode", num_devices, 0)?;
    let rd_pauses = int_list_broadcast(&clauses, "rdpause", num_devices, 0)?;
    let wr_pauses = int_list_broadcast(&clauses, "wrpause", num_devices, 0)?;

    let hm_offset_gib = u64_clause(&clauses, "hmo", 0)?;
    let hm_size_gib = u64_clause(&clauses, "hms", capacities_gib.iter().sum())?;

    if write_protect {
        for &m in &wp_modes {
            if m > 1 {
                return Err(PmbdError::ConfigInvalid(format!(
                    "wpmode must be 0 (PTE) or 1 (bypass), got {m}"
                )));
            }
        }
    }

    let mut devices = Vec::with_capacity(num_devices);
    for i in 0..num_devices {
        let capacity_sectors = capacities_gib[i] * (1u64 << 30) / crate::sector::SECTOR_SIZE;

        let read_mode = if sim_modes[i] == 1 {
            EmulationMode::RelativeSlowdown { factor: rd_sxs[i] }
        } else if rd_lats[i] > 0 || rd_bws[i] > 0 {
            EmulationMode::Absolute {
                latency_ns: rd_lats[i],
                bandwidth_bytes_per_sec: if rd_bws[i] > 0 {
                    Some(rd_bws[i] * 1024 * 1024)
                } else {
                    None
                },
            }
        } else {
            EmulationMode::Disabled
        };

        let write_mode = if sim_modes[i] == 1 {
            EmulationMode::RelativeSlowdown { factor: wr_sxs[i] }
        } else if wr_lats[i] > 0 || wr_bws[i] > 0 {
            EmulationMode::Absolute {
                latency_ns: wr_lats[i],
                bandwidth_bytes_per_sec: if wr_bws[i] > 0 {
                    Some(wr_bws[i] * 1024 * 1024)
                } else {
                    None
                },
            }
        } else {
            EmulationMode::Disabled
        };

        let wp_mode = if wp_modes[i] == 1 {
            WriteProtectMode::Bypass
        } else {
            WriteProtectMode::Pte
        };

        devices.push(DeviceConfig {
            capacity_sectors,
            hm_offset_gib,
            hm_size_gib,
            pmap,
            nts,
            ntl,
            honor_flush,
            honor_fua,
            cache,
            write_back_flush,
            write_protect,
            wp_mode,
            wrverify,
            checksum,
            subupdate,
            lock_enabled,
            mergeable,
            rd_pause_cycles: rd_pauses[i],
            wr_pause_cycles: wr_pauses[i],
            buf_size_mib: buf_sizes_mib[i],
            buf_num,
            buf_stride,
            batch: batches[i] as usize,
            read_mode,
            write_mode,
        });
    }

    Ok(Config { devices, adj_ns })
}

fn find<'a>(clauses: &'a [(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    clauses.iter().find(|(n, _)| *n == name).map(|(_, b)| *b)
}

fn string_clause(clauses: &[(&str, &str)], name: &str) -> Option<String> {
    find(clauses, name).map(|s| s.to_string())
}

fn bool_clause(clauses: &[(&str, &str)], name: &str, default: bool) -> Result<bool> {
    match find(clauses, name) {
        None => Ok(default),
        Some("Y") => Ok(true),
        Some("N") => Ok(false),
        Some(other) => Err(PmbdError::ConfigInvalid(format!(
            "clause `{name}` expects Y or N, got `{other}`"
        ))),
    }
}

fn parse_u64_list(body: &str) -> Result<Vec<u64>> {
    body.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| PmbdError::ConfigInvalid(format!("expected integer, got `{s}`")))
        })
        .collect()
}

fn u64_clause(clauses: &[(&str, &str)], name: &str, default: u64) -> Result<u64> {
    match find(clauses, name) {
        None => Ok(default),
        Some(body) => body
            .trim()
            .parse::<u64>()
            .map_err(|_| PmbdError::ConfigInvalid(format!("clause `{name}` expects an integer"))),
    }
}

fn usize_clause(clauses: &[(&str, &str)], name: &str, default: usize) -> Result<usize> {
    Ok(u64_clause(clauses, name, default as u64)? as usize)
}

fn int_list_broadcast(clauses: &[(&str, &str)], name: &str, n: usize, default: u64) -> Result<Vec<u64>> {
    match find(clauses, name) {
        None => Ok(vec![default; n]),
        Some(body) => {
            let values = parse_u64_list(body)?;
            broadcast(values, n, name)
        }
    }
}

fn float_list_broadcast(clauses: &[(&str, &str)], name: &str, n: usize, default: f64) -> Result<Vec<f64>> {
    match find(clauses, name) {
        None => Ok(vec![default; n]),
        Some(body) => {
            let values: Result<Vec<f64>> = body
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.trim()
                        .parse::<f64>()
                        .map_err(|_| PmbdError::ConfigInvalid(format!("expected float, got `{s}`")))
                })
                .collect();
            broadcast(values?, n, name)
        }
    }
}

fn broadcast<T: Clone>(values: Vec<T>, n: usize, name: &str) -> Result<Vec<T>> {
    match values.len() {
        0 => Err(PmbdError::ConfigInvalid(format!("clause `{name}` has no values"))),
        1 => Ok(vec![values[0].clone(); n]),
        len if len == n => Ok(values),
        len => Err(PmbdError::ConfigInvalid(format!(
            "clause `{name}` has {len} values but {n} devices were declared"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg = parse("pmbd<1>").unwrap();
        assert_eq!(cfg.devices.len(), 1);
        assert_eq!(cfg.devices[0].capacity_sectors, (1u64 << 30) / 512);
    }

    #[test]
    fn parses_two_devices_with_broadcast_clause() {
        let cfg = parse("pmbd<1,2>;wrprot<Y>;wpmode<0,1>;checksum<Y>").unwrap();
        assert_eq!(cfg.devices.len(), 2);
        assert!(cfg.devices[0].write_protect);
        assert_eq!(cfg.devices[0].wp_mode, WriteProtectMode::Pte);
        assert_eq!(cfg.devices[1].wp_mode, WriteProtectMode::Bypass);
        assert!(cfg.devices[0].checksum);
    }

    #[test]
    fn rejects_pmap_with_wrprot() {
        let err = parse("pmbd<1>;pmap<Y>;wrprot<Y>").unwrap_err();
        assert!(matches!(err, PmbdError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_rammode() {
        let err = parse("pmbd<1>;rammode<0>").unwrap_err();
        assert!(matches!(err, PmbdError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_mismatched_list_length() {
        let err = parse("pmbd<1,2,3>;wpmode<0,1>").unwrap_err();
        assert!(matches!(err, PmbdError::ConfigInvalid(_)));
    }

    #[test]
    fn parses_pause_and_adj_clauses() {
        let cfg = parse("pmbd<1>;rdpause<1000>;wrpause<2000>;adj<500>").unwrap();
        assert_eq!(cfg.devices[0].rd_pause_cycles, 1000);
        assert_eq!(cfg.devices[0].wr_pause_cycles, 2000);
        assert_eq!(cfg.adj_ns, 500);
    }

    #[test]
    fn lock_clause_defaults_to_enabled() {
        let cfg = parse("pmbd<1>").unwrap();
        assert!(cfg.devices[0].lock_enabled);
        let cfg = parse("pmbd<1>;lock<N>").unwrap();
        assert!(!cfg.devices[0].lock_enabled);
    }

    #[test]
    fn mgb_clause_controls_mergeable_flag() {
        let cfg = parse("pmbd<1>").unwrap();
        assert!(cfg.devices[0].mergeable);
        let cfg = parse("pmbd<1>;mgb<N>").unwrap();
        assert!(!cfg.devices[0].mergeable);
    }

    #[test]
    fn device_names_use_ordinal_suffix() {
        assert_eq!(device_name(0), "pmbda");
        assert_eq!(device_name(1), "pmbdb");
        assert_eq!(device_name(25), "pmbdz");
    }
}
