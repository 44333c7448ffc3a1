//! Directive strings and their canonical parse
//!
//! Constraint and obligation directives flow out of the decision engines as
//! free-form text ("10 per min", "anonymize-pii", "notify:admin") and into
//! processors and executors. Parsing is centralized here so that processors
//! match on structure, never by sniffing strings themselves.

use std::sync::OnceLock;

use regex::Regex;

use crate::context::parse_hhmm;

/// A parsed directive
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Admit up to `limit` events per sliding window
    RateLimit { limit: u32, window_ms: u64 },

    /// Mask configured PII key paths in the response payload
    Anonymize,

    /// Allow only the listed ISO country codes
    GeoRestrict { countries: Vec<String> },

    /// Assert the request time falls inside a daily window (minutes)
    TimeWindow { start_min: u32, end_min: u32 },

    /// Write an audit entry
    Log,

    /// Out-of-band alert to a target
    Notify { target: String },

    /// Schedule retention deletion after N days
    DeleteAfter { days: u32 },

    /// Unrecognized text, kept verbatim for logging
    Unknown(String),
}

/// Whether a directive shapes the response or runs after it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveFamily {
    Constraint,
    Obligation,
    Unknown,
}

impl Directive {
    /// Parse a raw directive string
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let lower = trimmed.to_lowercase();

        if let Some(d) = parse_rate_limit(trimmed) {
            return d;
        }

        if lower.contains("anonymize") || trimmed.contains("匿名化") {
            return Self::Anonymize;
        }

        if let Some(rest) = lower.strip_prefix("geo-restrict:") {
            let countries: Vec<String> = rest
                .split(',')
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect();
            if !countries.is_empty() {
                return Self::GeoRestrict { countries };
            }
        }

        if let Some(rest) = lower.strip_prefix("time-window:") {
            if let Some((start, end)) = rest.split_once('-') {
                if let (Ok(start_min), Ok(end_min)) = (parse_hhmm(start), parse_hhmm(end)) {
                    return Self::TimeWindow { start_min, end_min };
                }
            }
        }

        if lower == "log" || lower.starts_with("log:") || lower.starts_with("log ") {
            return Self::Log;
        }

        if lower == "notify" {
            return Self::Notify {
                target: "admin".to_string(),
            };
        }
        if let Some(target) = lower.strip_prefix("notify:") {
            return Self::Notify {
                target: target.trim().to_string(),
            };
        }

        if let Some(rest) = lower.strip_prefix("delete-after:") {
            let days = rest.trim().trim_end_matches('d');
            if let Ok(days) = days.parse::<u32>() {
                return Self::DeleteAfter { days };
            }
        }

        Self::Unknown(trimmed.to_string())
    }

    /// Which side of the enforcement pipeline consumes this directive
    pub fn family(&self) -> DirectiveFamily {
        match self {
            Self::RateLimit { .. }
            | Self::Anonymize
            | Self::GeoRestrict { .. }
            | Self::TimeWindow { .. } => DirectiveFamily::Constraint,
            Self::Log | Self::Notify { .. } | Self::DeleteAfter { .. } => {
                DirectiveFamily::Obligation
            }
            Self::Unknown(_) => DirectiveFamily::Unknown,
        }
    }
}

/// Parse rate-limit phrasings: `10/sec`, `100 per min`, `60/hour`, `10回/分`
fn parse_rate_limit(raw: &str) -> Option<Directive> {
    static EN: OnceLock<Regex> = OnceLock::new();
    static JP: OnceLock<Regex> = OnceLock::new();

    let en = EN.get_or_init(|| {
        Regex::new(r"(?i)\b(\d+)\s*(?:/|per\s+)\s*(sec(?:ond)?s?|min(?:ute)?s?|hours?|hr|[smh])\b")
            .expect("rate limit regex")
    });
    let jp = JP.get_or_init(|| Regex::new(r"(\d+)\s*回?\s*/\s*(秒|分|時)").expect("jp rate regex"));

    if let Some(caps) = en.captures(raw) {
        let limit: u32 = caps[1].parse().ok()?;
        let window_ms = match caps[2].to_lowercase().chars().next()? {
            's' => 1_000,
            'm' => 60_000,
            _ => 3_600_000,
        };
        return Some(Directive::RateLimit { limit, window_ms });
    }

    if let Some(caps) = jp.captures(raw) {
        let limit: u32 = caps[1].parse().ok()?;
        let window_ms = match &caps[2] {
            "秒" => 1_000,
            "分" => 60_000,
            _ => 3_600_000,
        };
        return Some(Directive::RateLimit { limit, window_ms });
    }

    None
}

/// Split raw directive strings into constraint and obligation lists
///
/// Unknown directives are routed to the constraint side so the constraint
/// manager can record the soft failure in one place.
pub fn split_families(directives: &[String]) -> (Vec<String>, Vec<String>) {
    let mut constraints = Vec::new();
    let mut obligations = Vec::new();
    for raw in directives {
        match Directive::parse(raw).family() {
            DirectiveFamily::Obligation => obligations.push(raw.clone()),
            _ => constraints.push(raw.clone()),
        }
    }
    (constraints, obligations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_forms() {
        for (raw, limit, window) in [
            ("10/sec", 10, 1_000),
            ("10 per sec", 10, 1_000),
            ("100/min", 100, 60_000),
            ("100 per minute", 100, 60_000),
            ("5 per hour", 5, 3_600_000),
            ("60/h", 60, 3_600_000),
            ("rate limit to 10 per min", 10, 60_000),
        ] {
            assert_eq!(
                Directive::parse(raw),
                Directive::RateLimit {
                    limit,
                    window_ms: window
                },
                "failed on {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_rate_limit_japanese() {
        assert_eq!(
            Directive::parse("10回/分"),
            Directive::RateLimit {
                limit: 10,
                window_ms: 60_000
            }
        );
    }

    #[test]
    fn test_anonymize_forms() {
        assert_eq!(Directive::parse("anonymize-pii"), Directive::Anonymize);
        assert_eq!(
            Directive::parse("個人情報を匿名化する"),
            Directive::Anonymize
        );
    }

    #[test]
    fn test_geo_restrict() {
        assert_eq!(
            Directive::parse("geo-restrict:jp, us"),
            Directive::GeoRestrict {
                countries: vec!["JP".into(), "US".into()]
            }
        );
    }

    #[test]
    fn test_time_window() {
        assert_eq!(
            Directive::parse("time-window:09:00-18:00"),
            Directive::TimeWindow {
                start_min: 540,
                end_min: 1080
            }
        );
    }

    #[test]
    fn test_obligations() {
        assert_eq!(Directive::parse("log"), Directive::Log);
        assert_eq!(
            Directive::parse("notify:secops"),
            Directive::Notify {
                target: "secops".into()
            }
        );
        assert_eq!(
            Directive::parse("delete-after:30d"),
            Directive::DeleteAfter { days: 30 }
        );
    }

    #[test]
    fn test_unknown_preserved() {
        let d = Directive::parse("sign-response-with-hmac");
        assert_eq!(d, Directive::Unknown("sign-response-with-hmac".into()));
        assert_eq!(d.family(), DirectiveFamily::Unknown);
    }

    #[test]
    fn test_family_split() {
        let raw = vec![
            "10 per min".to_string(),
            "log".to_string(),
            "anonymize-pii".to_string(),
            "notify:admin".to_string(),
        ];
        let (constraints, obligations) = split_families(&raw);
        assert_eq!(constraints, vec!["10 per min", "anonymize-pii"]);
        assert_eq!(obligations, vec!["log", "notify:admin"]);
    }
}
