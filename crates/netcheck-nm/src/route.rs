//! Default-route lookup from the kernel routing table.

use std::net::Ipv4Addr;

use crate::error::Error;

pub const PROC_NET_ROUTE: &str = "/proc/net/route";

const RTF_UP: u16 = 0x0001;
const RTF_GATEWAY: u16 = 0x0002;

/// An IPv4 default route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub interface: String,
    pub gateway: Ipv4Addr,
    pub metric: u32,
}

/// Read the routing table and return the default route with the lowest metric.
pub async fn read_default_route() -> Result<Option<DefaultRoute>, Error> {
    let table = tokio::fs::read_to_string(PROC_NET_ROUTE).await?;
    parse_default_route(&table)
}

/// Parse `/proc/net/route` content.
///
/// Addresses are hex in host (little-endian) byte order. Only routes with
/// destination and mask `0.0.0.0` and flags `RTF_UP | RTF_GATEWAY` count.
pub fn parse_default_route(table: &str) -> Result<Option<DefaultRoute>, Error> {
    let mut best: Option<DefaultRoute> = None;

    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [interface, destination, gateway, flags, _refcnt, _use, metric, mask, ..] =
            fields.as_slice()
        else {
            continue;
        };

        if parse_hex_u32(destination)? != 0 || parse_hex_u32(mask)? != 0 {
            continue;
        }
        let flags = u16::from_str_radix(flags, 16)
            .map_err(|e| Error::malformed("route flags", format!("{flags}: {e}")))?;
        if flags & (RTF_UP | RTF_GATEWAY) != RTF_UP | RTF_GATEWAY {
            continue;
        }
        let metric: u32 = metric
            .parse()
            .map_err(|e| Error::malformed("route metric", format!("{metric}: {e}")))?;

        let route = DefaultRoute {
            interface: (*interface).to_owned(),
            gateway: Ipv4Addr::from(parse_hex_u32(gateway)?.to_le_bytes()),
            metric,
        };
        if best.as_ref().is_none_or(|current| route.metric < current.metric) {
            best = Some(route);
        }
    }

    Ok(best)
}

fn parse_hex_u32(field: &str) -> Result<u32, Error> {
    u32::from_str_radix(field, 16).map_err(|e| Error::malformed("route address", format!("{field}: {e}")))
}
