//! Mobile User-Agent rotation, one pick per attempt

const DEFAULT_MOBILE_AGENTS: &[&str] = &[
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.6367.82 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; SM-S9110) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.230 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 12; M2012K11AC) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.5845.114 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; V2309A) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.5993.80 Mobile Safari/537.36",
];

pub fn default_mobile_agents() -> Vec<String> {
    DEFAULT_MOBILE_AGENTS.iter().map(ToString::to_string).collect()
}

#[derive(Debug, Clone)]
pub struct UserAgentRotator {
    agents: Vec<String>,
}

impl UserAgentRotator {
    /// An empty list falls back to the built-in mobile agents
    pub fn new(agents: Vec<String>) -> Self {
        let agents = if agents.is_empty() {
            default_mobile_agents()
        } else {
            agents
        };
        Self { agents }
    }

    pub fn pick(&self) -> &str {
        &self.agents[fastrand::usize(..self.agents.len())]
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for UserAgentRotator {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picks_from_configured_list() {
        let rotator = UserAgentRotator::new(vec!["ua-a".into(), "ua-b".into()]);
        for _ in 0..20 {
            assert!(matches!(rotator.pick(), "ua-a" | "ua-b"));
        }
    }

    #[test]
    fn test_empty_list_uses_mobile_defaults() {
        let rotator = UserAgentRotator::new(Vec::new());
        assert_eq!(rotator.len(), DEFAULT_MOBILE_AGENTS.len());
        assert!(rotator.pick().contains("Mobile"));
    }
}
