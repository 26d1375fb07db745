use std::collections::HashMap;

/// Connection settings for the console, layered flags over env over
/// `console.toml` over defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_url: String,
    pub auth_token: String,
    pub user_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            auth_token: "dev-token".into(),
            user_id: "dev-user".into(),
        }
    }
}

impl Settings {
    pub fn apply_file(&mut self, raw: &str) {
        let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) else {
            return;
        };
        if let Some(v) = file_cfg.get("server_url") {
            self.server_url = v.clone();
        }
        if let Some(v) = file_cfg.get("auth_token") {
            self.auth_token = v.clone();
        }
        if let Some(v) = file_cfg.get("user_id") {
            self.user_id = v.clone();
        }
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("APP__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("APP__AUTH_TOKEN") {
            self.auth_token = v;
        }
        if let Some(v) = lookup("APP__USER_ID") {
            self.user_id = v;
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = std::fs::read_to_string("console.toml") {
        settings.apply_file(&raw);
    }
    settings.apply_env(|name| std::env::var(name).ok());
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let mut settings = Settings::default();
        settings.apply_file("server_url = \"https://chat.example\"\nuser_id = \"alice\"\n");
        assert_eq!(settings.server_url, "https://chat.example");
        assert_eq!(settings.user_id, "alice");
        assert_eq!(settings.auth_token, "dev-token");
    }

    #[test]
    fn env_values_override_file_values() {
        let mut settings = Settings::default();
        settings.apply_file("server_url = \"https://chat.example\"\n");
        settings.apply_env(|name| {
            (name == "APP__SERVER_URL").then(|| "https://env.example".to_owned())
        });
        assert_eq!(settings.server_url, "https://env.example");
    }

    #[test]
    fn malformed_file_is_ignored() {
        let mut settings = Settings::default();
        settings.apply_file("not toml at all [");
        assert_eq!(settings, Settings::default());
    }
}
