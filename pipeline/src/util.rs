use std::env;

/// Format a message as a fixed-width banner: `--------MESSAGE--------`
/// Total width is always 70 characters.
pub fn banner(msg: &str) -> String {
    const TOTAL_WIDTH: usize = 70;
    const MIN_DASHES: usize = 2;
    const PADDING: usize = 1;
    let max_msg_len = TOTAL_WIDTH - (MIN_DASHES * 2) - (PADDING * 2);

    let msg: String = msg.chars().take(max_msg_len).collect();
    let remaining = TOTAL_WIDTH - msg.chars().count();
    let left = remaining / 2;
    let right = remaining - left;

    format!(
        "{}- {} -{}",
        "-".repeat(left - 1 - PADDING),
        msg,
        "-".repeat(right - 1 - PADDING)
    )
}

/// Identifier of this host, written into claim locks.
pub fn host_name() -> String {
    env::var("HOSTNAME")
        .or_else(|_| env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_is_fixed_width() {
        assert_eq!(banner("STATUS").chars().count(), 70);
        assert_eq!(banner("").chars().count(), 70);
        let long = "x".repeat(100);
        assert_eq!(banner(&long).chars().count(), 70);
    }
}
