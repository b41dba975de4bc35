use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use common::PoolTarget;
use uuid::Uuid;

use crate::p2p::AcceptorConfig;
use crate::pool_list::{CostFactors, ExclusionPatterns, FixedPoolList};
use crate::selection::SelectionKind;

/// Where the node gets its candidate pools from.
#[derive(Debug, Clone)]
pub enum PoolSource {
    Fixed(String),
    Manager {
        url: String,
        target: PoolTarget,
        exclude: ExclusionPatterns,
        factors: CostFactors,
    },
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub pool_name: String,
    pub data_dir: PathBuf,
    pub http_bind: SocketAddr,
    pub acceptor: AcceptorConfig,
    pub advertise_host: Option<String>,
    pub pools: PoolSource,
    pub selection: SelectionKind,
    pub pool_refresh: Duration,
    pub pool_query_timeout: Duration,
    /// How long an incoming transfer session may go without receiving bytes.
    pub session_timeout: Duration,
    pub sticky_sweep: Duration,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let pool_name = var("POOLMESH_POOL_NAME").unwrap_or_else(|| {
            let id = Uuid::new_v4().simple().to_string();
            format!("pool-{}", &id[..8])
        });

        let data_dir = var("POOLMESH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/pool-node"));

        let http_bind = parsed(&var, "POOLMESH_HTTP_BIND")?
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8090)));

        let mut acceptor = AcceptorConfig::default();
        if let Some(addr) = parsed::<IpAddr>(&var, "POOLMESH_P2P_BIND_ADDR")? {
            acceptor.bind_addr = addr;
        }
        acceptor.port = parsed(&var, "POOLMESH_P2P_PORT")?;
        if let Some(range) = var("POOLMESH_P2P_PORT_RANGE") {
            acceptor.port_range = Some(
                parse_port_range(&range).context("invalid POOLMESH_P2P_PORT_RANGE")?,
            );
        }

        let pools = match (var("POOLMESH_FIXED_POOLS"), var("POOLMESH_POOL_MANAGER_URL")) {
            (Some(_), Some(_)) => {
                bail!("POOLMESH_FIXED_POOLS and POOLMESH_POOL_MANAGER_URL are mutually exclusive")
            }
            (Some(fixed), None) => {
                FixedPoolList::parse(&fixed).context("invalid POOLMESH_FIXED_POOLS")?;
                PoolSource::Fixed(fixed)
            }
            (None, Some(url)) => {
                let target = match var("POOLMESH_POOL_TARGET") {
                    Some(value) => {
                        parse_pool_target(&value).context("invalid POOLMESH_POOL_TARGET")?
                    }
                    None => PoolTarget::Group("default".to_string()),
                };
                let patterns = var("POOLMESH_EXCLUDE").unwrap_or_default();
                let exclude = ExclusionPatterns::new(
                    patterns
                        .split(',')
                        .map(str::trim)
                        .filter(|pattern| !pattern.is_empty()),
                )
                .context("invalid POOLMESH_EXCLUDE")?;
                let defaults = CostFactors::default();
                let factors = CostFactors::new(
                    parsed(&var, "POOLMESH_SPACE_FACTOR")?.unwrap_or(defaults.space),
                    parsed(&var, "POOLMESH_CPU_FACTOR")?.unwrap_or(defaults.cpu),
                )
                .context("invalid cost factors")?;
                PoolSource::Manager {
                    url,
                    target,
                    exclude,
                    factors,
                }
            }
            (None, None) => PoolSource::Fixed(String::new()),
        };

        let selection = match var("POOLMESH_SELECTION") {
            Some(value) => SelectionKind::parse(&value).context("invalid POOLMESH_SELECTION")?,
            None => SelectionKind::Proportional,
        };

        Ok(Self {
            pool_name,
            data_dir,
            http_bind,
            acceptor,
            advertise_host: var("POOLMESH_P2P_ADVERTISE_HOST"),
            pools,
            selection,
            pool_refresh: secs(&var, "POOLMESH_POOL_REFRESH_SECS", 60)?,
            pool_query_timeout: Duration::from_millis(
                parsed(&var, "POOLMESH_POOL_QUERY_TIMEOUT_MS")?.unwrap_or(5_000),
            ),
            session_timeout: secs(&var, "POOLMESH_P2P_SESSION_TIMEOUT_SECS", 600)?,
            sticky_sweep: secs(&var, "POOLMESH_STICKY_SWEEP_SECS", 300)?,
        })
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key}={value:?}"))
        })
        .transpose()
}

fn secs(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let value = parsed(var, key)?.unwrap_or(default);
    if value == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Duration::from_secs(value))
}

/// Parses `lo:hi` or `lo-hi`.
pub fn parse_port_range(value: &str) -> Result<RangeInclusive<u16>> {
    let Some((lo, hi)) = value.split_once([':', '-']) else {
        bail!("expected lo:hi, got {value:?}");
    };
    let lo: u16 = lo.trim().parse().with_context(|| format!("bad port {lo:?}"))?;
    let hi: u16 = hi.trim().parse().with_context(|| format!("bad port {hi:?}"))?;
    if lo == 0 || lo > hi {
        bail!("port range {lo}:{hi} is empty or starts at 0");
    }
    Ok(lo..=hi)
}

/// Parses `group:<name>`, `link:<name>` or `names:a,b,c`.
pub fn parse_pool_target(value: &str) -> Result<PoolTarget> {
    let Some((kind, rest)) = value.split_once(':') else {
        bail!("expected group:<name>, link:<name> or names:<a,b>, got {value:?}");
    };
    let rest = rest.trim();
    if rest.is_empty() {
        bail!("pool target {value:?} has no value");
    }

    match kind.trim() {
        "group" => Ok(PoolTarget::Group(rest.to_string())),
        "link" => Ok(PoolTarget::Link(rest.to_string())),
        "names" => Ok(PoolTarget::Names(
            rest.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        other => bail!("unknown pool target kind {other:?}"),
    }
}
