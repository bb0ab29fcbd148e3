//! Temporary port ranges: `1-5,10,12,15-15`.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

fn parse_port(text: &str) -> Result<u16> {
    let port: u32 = text
        .trim()
        .parse()
        .map_err(|e| Error::Validation(format!("invalid port {:?}: {}", text, e)))?;

    if port == 0 || port > u16::MAX as u32 {
        return Err(Error::Validation(format!(
            "port {} is out of range; ports must be between 1 and 65535",
            port
        )));
    }

    Ok(port as u16)
}

/// Expands a comma-separated list of ports and inclusive `low-high`
/// ranges, keeping the order given. Repeated ports are kept once.
pub fn parse_ports(text: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    let mut seen = BTreeSet::new();

    for item in text.split(',') {
        match item.split_once('-') {
            Some((low, high)) => {
                let low = parse_port(low)?;
                let high = parse_port(high)?;
                if low > high {
                    return Err(Error::Validation(format!(
                        "invalid port range {:?}: {} is greater than {}",
                        item.trim(),
                        low,
                        high
                    )));
                }
                ports.extend((low..=high).filter(|p| seen.insert(*p)));
            }
            None => {
                let port = parse_port(item)?;
                if seen.insert(port) {
                    ports.push(port);
                }
            }
        }
    }

    Ok(ports)
}
