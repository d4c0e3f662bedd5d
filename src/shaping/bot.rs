use anyhow::{Context, Result};
use regex::Regex;

/// User-agent based bot detection.
///
/// A request is blocked when any deny pattern matches the UA and no allow
/// pattern does. An absent or empty UA is allowed — plenty of legitimate
/// internal clients send none, and rejecting them creates more noise than it
/// stops.
pub struct BotDetector {
    deny: Vec<Regex>,
    allow: Vec<Regex>,
}

impl BotDetector {
    pub fn new(deny: &[String], allow: &[String]) -> Result<Self> {
        Ok(Self {
            deny: compile(deny).context("compiling bot deny patterns")?,
            allow: compile(allow).context("compiling bot allow patterns")?,
        })
    }

    /// Returns true when the request should be blocked with 403.
    pub fn is_blocked(&self, user_agent: &str) -> bool {
        if user_agent.is_empty() {
            return false;
        }
        let denied = self.deny.iter().any(|re| re.is_match(user_agent));
        if !denied {
            return false;
        }
        !self.allow.iter().any(|re| re.is_match(user_agent))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid pattern {:?}", p)))
        .collect()
}
