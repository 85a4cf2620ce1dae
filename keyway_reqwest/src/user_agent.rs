use std::fmt;

use reqwest::header::{HeaderValue, InvalidHeaderValue};

/// The product token sent when no other user agent is configured
pub const DEFAULT_USER_AGENT: &str = concat!("keyway/", env!("CARGO_PKG_VERSION"));

/// The `User-Agent` sent with every request
///
/// Applications identify themselves by prepending their own product tokens,
/// which are sent ahead of [`DEFAULT_USER_AGENT`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserAgent {
    prepend: Vec<String>,
}

impl UserAgent {
    /// Constructs a user agent that sends only [`DEFAULT_USER_AGENT`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds product tokens in front of the ones already present
    ///
    /// The tokens keep the order in which they are given.
    pub fn prepend<I, S>(&mut self, tokens: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut prepend: Vec<String> = tokens.into_iter().map(Into::into).collect();
        prepend.append(&mut self.prepend);
        self.prepend = prepend;
        self
    }

    /// Builder form of [`prepend()`][Self::prepend()]
    pub fn with_prepended<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prepend(tokens);
        self
    }

    /// The full user agent string
    pub fn join(&self) -> String {
        self.to_string()
    }

    pub(crate) fn header_value(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::try_from(self.join())
    }
}

impl fmt::Display for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.prepend {
            f.write_str(token)?;
            f.write_str(" ")?;
        }
        f.write_str(DEFAULT_USER_AGENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sends_only_the_library_token() {
        assert_eq!(UserAgent::new().join(), DEFAULT_USER_AGENT);
    }

    #[test]
    fn prepended_tokens_come_first() {
        let mut agent = UserAgent::new();
        agent.prepend(["app/1.0"]);
        agent.prepend(["wrapper/2.1", "plugin/0.3"]);

        assert_eq!(
            agent.join(),
            format!("wrapper/2.1 plugin/0.3 app/1.0 {DEFAULT_USER_AGENT}")
        );
    }

    #[test]
    fn user_agent_is_a_valid_header() {
        let agent = UserAgent::new().with_prepended(["app/1.0"]);
        let value = agent.header_value().unwrap();
        assert_eq!(value.to_str().unwrap(), agent.join());
    }
}
