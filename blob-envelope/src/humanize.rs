const STEP: f64 = 1000_f64;
const SUFFIXES: &[&str] = &["B", "kB", "MB", "GB", "TB"];

/// Renders a byte count for log lines (e.g., "1.5 kB").
pub fn bytes(n: usize) -> String {
    let mut v = n as f64;
    let mut idx = 0;
    while v >= STEP && idx < SUFFIXES.len() - 1 {
        v /= STEP;
        idx += 1;
    }
    if idx == 0 {
        return format!("{} {}", n, SUFFIXES[0]);
    }

    // drop trailing zeros, "1.50" reads as "1.5"
    let s = format!("{:.2}", v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", s, SUFFIXES[idx])
}

#[test]
fn test_humanize_bytes() {
    assert_eq!(bytes(0), "0 B");
    assert_eq!(bytes(999), "999 B");
    assert_eq!(bytes(1500), "1.5 kB");
    assert_eq!(bytes(100_000), "100 kB");
    assert_eq!(bytes(490_652_508_160), "490.65 GB");
}
