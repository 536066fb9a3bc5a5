use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub local_state_path: Option<PathBuf>,
    pub public_base_url: String,
    pub cors_origins: Vec<String>,
    pub ai_rate_limit_per_minute: u32,
    /// Live course sessions older than this are dropped.
    pub course_session_ttl_secs: u64,
    pub gemini: Option<GeminiSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            database_url: None,
            local_state_path: None,
            public_base_url: "http://localhost:5173".into(),
            cors_origins: vec!["http://localhost:5173".into()],
            ai_rate_limit_per_minute: 15,
            course_session_ttl_secs: 6 * 60 * 60,
            gemini: None,
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty)
    }

    /// Builds settings from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let gemini = lookup("GEMINI_API_KEY").map(|api_key| GeminiSettings {
            api_key,
            model: lookup("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.5-flash".to_string()),
            base_url: lookup("GEMINI_BASE_URL")
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout_secs: lookup("GEMINI_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        });

        Self {
            host: lookup("BACKEND_HOST").unwrap_or(defaults.host),
            port: lookup("BACKEND_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database_url: lookup("DATABASE_URL"),
            local_state_path: lookup("LOCAL_STATE_PATH").map(PathBuf::from),
            public_base_url: lookup("PUBLIC_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.public_base_url),
            cors_origins: lookup("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
            ai_rate_limit_per_minute: lookup("AI_RATE_LIMIT_PER_MINUTE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.ai_rate_limit_per_minute),
            course_session_ttl_secs: lookup("COURSE_SESSION_TTL_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.course_session_ttl_secs),
            gemini,
        }
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn share_link(&self, content_id: &str) -> String {
        format!("{}/#view/{}", self.public_base_url, content_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let s = Settings::from_lookup(lookup(&[]));
        assert_eq!(s.port, 8080);
        assert!(s.gemini.is_none());
        assert!(s.local_state_path.is_none());
        assert_eq!(s.course_session_ttl_secs, 21600);
        assert_eq!(s.bind_addr().unwrap().port(), 8080);
    }

    #[test]
    fn overrides_and_gemini_section() {
        let s = Settings::from_lookup(lookup(&[
            ("BACKEND_PORT", "9000"),
            ("PUBLIC_BASE_URL", "https://quillan.example/"),
            ("CORS_ORIGINS", "https://a.example, https://b.example,"),
            ("GEMINI_API_KEY", "k"),
            ("GEMINI_TIMEOUT_SECS", "nope"),
            ("COURSE_SESSION_TTL_SECS", "900"),
        ]));
        assert_eq!(s.port, 9000);
        assert_eq!(s.course_session_ttl_secs, 900);
        assert_eq!(s.cors_origins, vec!["https://a.example", "https://b.example"]);
        assert_eq!(s.share_link("abc"), "https://quillan.example/#view/abc");
        let gemini = s.gemini.unwrap();
        assert_eq!(gemini.model, "gemini-2.5-flash");
        assert_eq!(gemini.timeout_secs, 60);
    }
}
