//! Address allocation inside the tunnel subnet
//!
//! Allocation is a pure scan: the smallest free host index wins, which keeps
//! assignment deterministic and regression tests stable.

use crate::error::{ConsoleError, Result};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Pick the first free host address in `subnet` between `start` and `end`
/// (inclusive host indices).
pub fn allocate(
    subnet: Ipv4Net,
    start: u32,
    end: u32,
    used: &HashSet<Ipv4Addr>,
) -> Result<Ipv4Addr> {
    let base = u32::from(subnet.network());
    for index in start..=end {
        let candidate = Ipv4Addr::from(base + index);
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ConsoleError::AddressPoolExhausted)
}
