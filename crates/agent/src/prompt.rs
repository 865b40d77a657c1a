//! System prompt templating.
//!
//! Templates use `{placeholder}` markers filled per request:
//! `{bot_name}`, `{model_name}`, `{date}`, `{time}`, `{timezone}`,
//! `{user_name}`, `{user_lang}`. Unknown markers are left as written.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use tracing::warn;

/// Values substituted into the template for one turn.
#[derive(Debug, Clone)]
pub struct PromptVars<'a> {
    pub bot_name: &'a str,
    pub model_name: &'a str,
    pub timezone: &'a str,
    pub user_name: Option<&'a str>,
    pub user_lang: Option<&'a str>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SystemPrompt {
    template: String,
}

impl SystemPrompt {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, vars: &PromptVars<'_>) -> String {
        let offset = parse_offset(vars.timezone).unwrap_or_else(|| {
            warn!(timezone = vars.timezone, "Unrecognized timezone, using UTC");
            utc()
        });
        let local = vars.now.with_timezone(&offset);

        self.template
            .replace("{bot_name}", vars.bot_name)
            .replace("{model_name}", vars.model_name)
            .replace("{date}", &local.format("%A, %B %-d, %Y").to_string())
            .replace("{time}", &local.format("%H:%M").to_string())
            .replace("{timezone}", vars.timezone)
            .replace("{user_name}", vars.user_name.unwrap_or("User"))
            .replace("{user_lang}", vars.user_lang.unwrap_or("en"))
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

/// Accepts `UTC`/`GMT`, optionally followed by an offset, or a bare
/// `+HH:MM` / `-HH` offset.
fn parse_offset(timezone: &str) -> Option<FixedOffset> {
    let tz = timezone.trim();
    let rest = tz
        .strip_prefix("UTC")
        .or_else(|| tz.strip_prefix("GMT"))
        .unwrap_or(tz);
    if rest.is_empty() {
        return Some(utc());
    }

    let (sign, digits) = match rest.as_bytes().first()? {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (digits.parse::<i32>().ok()?, 0),
    };
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vars(timezone: &str) -> PromptVars<'_> {
        PromptVars {
            bot_name: "Parley",
            model_name: "moonshotai/kimi-k2.5",
            timezone,
            user_name: Some("Alice"),
            user_lang: None,
            now: Utc.with_ymd_and_hms(2026, 3, 9, 22, 30, 0).unwrap(),
        }
    }

    #[test]
    fn fills_all_placeholders() {
        let prompt = SystemPrompt::new(
            "I am {bot_name} on {model_name}. Today is {date}, {time} {timezone}. Hi {user_name} ({user_lang}).",
        );
        let out = prompt.render(&vars("UTC"));
        assert_eq!(
            out,
            "I am Parley on moonshotai/kimi-k2.5. Today is Monday, March 9, 2026, 22:30 UTC. Hi Alice (en)."
        );
    }

    #[test]
    fn offset_moves_date_and_time() {
        let out = SystemPrompt::new("{date} {time}").render(&vars("UTC+02:00"));
        assert_eq!(out, "Tuesday, March 10, 2026 00:30");
    }

    #[test]
    fn unknown_markers_survive() {
        let out = SystemPrompt::new("{bot_name} {unknown}").render(&vars("UTC"));
        assert_eq!(out, "Parley {unknown}");
    }

    #[test]
    fn parses_offsets() {
        assert_eq!(parse_offset("UTC"), Some(utc()));
        assert_eq!(parse_offset("-05"), FixedOffset::west_opt(5 * 3600));
        assert_eq!(parse_offset("GMT+5:30"), FixedOffset::east_opt(5 * 3600 + 1800));
        assert_eq!(parse_offset("Europe/Paris"), None);
        assert_eq!(parse_offset("+25"), None);
    }
}
