use anyhow::{Result, bail};
use std::time::Duration;

/// Parse a human duration string like `30m`, `2h`, `1h30m`, `50ms`, `1d`
/// or `2d12h`. Units: `d` (days), `h`, `m`, `s`, `ms`. Components must
/// appear as `<integer><unit>` pairs with no separators.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        bail!("empty duration");
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek().copied() {
            if c.is_ascii_digit() {
                digits.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() {
            bail!("invalid duration '{input}': expected a number");
        }
        let value: u64 = digits.parse()?;

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied() {
            if c.is_ascii_alphabetic() {
                unit.push(c);
                chars.next();
            } else {
                break;
            }
        }

        let component = match unit.as_str() {
            "d" => Duration::from_secs(value * 24 * 3600),
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            "" => bail!("invalid duration '{input}': missing unit"),
            other => bail!("invalid duration '{input}': unknown unit '{other}'"),
        };
        total += component;
    }

    Ok(total)
}
