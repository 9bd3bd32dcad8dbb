use rand::Rng;
use std::time::Duration;

/// Uniformly random duration in `[min, max]`, millisecond resolution.
#[must_use]
pub fn random_between(min: Duration, max: Duration) -> Duration {
    let (min, max) = if min <= max { (min, max) } else { (max, min) };
    let min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if min_ms == max_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

/// Escapes `%`, `_` and `\` for use inside a SQL `LIKE` pattern.
#[must_use]
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_between_stays_in_bounds() {
        let min = Duration::from_secs(15 * 60);
        let max = Duration::from_secs(60 * 60);
        for _ in 0..200 {
            let d = random_between(min, max);
            assert!(d >= min && d <= max);
        }
        assert_eq!(random_between(max, max), max);
        assert!(random_between(max, min) >= min);
    }

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("100%_a\\b"), "100\\%\\_a\\\\b");
        assert_eq!(escape_like("천공"), "천공");
    }
}
