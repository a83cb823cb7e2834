use std::sync::Arc;

use rearch::CapsuleHandle;
use tracing::info;
use woothee::parser::Parser;

use crate::config::{TrackingSettings, settings_capsule};

const UNKNOWN: &str = "UNKNOWN";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedUserAgent {
    pub browser_family: String,
    pub browser_version: String,
    pub device_family: String,
}

impl ParsedUserAgent {
    /// Family and version, e.g. `Chrome 120.0.0.0`.
    #[must_use]
    pub fn browser(&self) -> String {
        format!("{} {}", self.browser_family, self.browser_version)
            .trim()
            .to_owned()
    }
}

pub trait UserAgentParser: Send + Sync {
    /// `None` when the header is empty or unrecognized.
    fn parse(&self, user_agent: &str) -> Option<ParsedUserAgent>;
}

pub fn user_agent_parser_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn UserAgentParser> {
    from_settings(&get.as_ref(settings_capsule).tracking)
}

/// Builds the parser selected by `TRACK_BROWSER`.
#[must_use]
pub fn from_settings(settings: &TrackingSettings) -> Arc<dyn UserAgentParser> {
    if settings.track_browser {
        Arc::new(WootheeParser::new())
    } else {
        info!("Browser tracking disabled");
        Arc::new(DisabledParser)
    }
}

pub struct DisabledParser;

impl UserAgentParser for DisabledParser {
    fn parse(&self, _user_agent: &str) -> Option<ParsedUserAgent> {
        None
    }
}

pub struct WootheeParser {
    parser: Parser,
}

impl WootheeParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
        }
    }
}

impl Default for WootheeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentParser for WootheeParser {
    fn parse(&self, user_agent: &str) -> Option<ParsedUserAgent> {
        let user_agent = user_agent.trim();
        if user_agent.is_empty() {
            return None;
        }

        let result = self.parser.parse(user_agent)?;
        let known = |value: &str| {
            if value == UNKNOWN {
                String::new()
            } else {
                value.to_owned()
            }
        };

        let parsed = ParsedUserAgent {
            browser_family: known(result.name),
            browser_version: known(&result.version),
            device_family: known(result.category),
        };
        (parsed != ParsedUserAgent::default()).then_some(parsed)
    }
}
