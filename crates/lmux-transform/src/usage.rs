use crate::ir::{StreamDelta, TokenUsage};

/// Collects token counts off a delta stream. Providers emit usage on their
/// final chunk (sometimes on several); the last non-zero value per field
/// wins.
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    latest: TokenUsage,
    seen: bool,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &StreamDelta) {
        if let StreamDelta::Finish {
            usage: Some(usage), ..
        } = delta
        {
            self.latest.merge(*usage);
            self.seen = true;
        }
    }

    pub fn finalize(&self) -> Option<TokenUsage> {
        self.seen.then_some(self.latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_nonzero_field_wins() {
        let mut acc = UsageAccumulator::new();
        acc.push(&StreamDelta::Finish {
            stop_reason: None,
            usage: Some(TokenUsage {
                input: 10,
                output: 0,
                cached: 2,
                reasoning: 0,
            }),
        });
        acc.push(&StreamDelta::Finish {
            stop_reason: None,
            usage: Some(TokenUsage {
                input: 10,
                output: 42,
                cached: 0,
                reasoning: 5,
            }),
        });
        let usage = acc.finalize().unwrap();
        assert_eq!(usage.input, 10);
        assert_eq!(usage.output, 42);
        assert_eq!(usage.cached, 2);
        assert_eq!(usage.reasoning, 5);
    }

    #[test]
    fn no_usage_yields_none() {
        let mut acc = UsageAccumulator::new();
        acc.push(&StreamDelta::Text {
            index: 0,
            text: "hi".into(),
        });
        assert!(acc.finalize().is_none());
    }
}
