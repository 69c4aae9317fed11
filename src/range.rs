use anyhow::{bail, Context, Result};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_START_PORT: u16 = 1;
pub const DEFAULT_END_PORT: u16 = 1024;

/// Parse an inclusive port range as typed by a user.
///
/// Supported forms:
/// - single port number: `80` (scans just that port)
/// - inclusive range: `1-1024`
/// - whitespace around either bound is ignored
pub fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty port range");
    }

    if let Some((a, b)) = s.split_once('-') {
        let start = parse_port_str(a.trim())
            .with_context(|| format!("invalid start in range: {a}"))?;
        let end =
            parse_port_str(b.trim()).with_context(|| format!("invalid end in range: {b}"))?;
        if start > end {
            bail!("invalid range {start}-{end} (start cannot exceed end)");
        }
        return Ok((start, end));
    }

    let p = parse_port_str(s).with_context(|| format!("invalid port value: {s}"))?;
    Ok((p, p))
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val > u32::from(u16::MAX) {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
