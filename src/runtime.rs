use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Name the compiled binary gets inside the staging directory
pub const BINARY_NAME: &str = "pocapp";

/// Supported PoC languages
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    /// Interpreted script, run directly
    Python,
    /// Compiled source, built to a binary which is then run
    Go,
    /// Shell script, run by a shell interpreter
    Bash,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::Go, Language::Bash];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Go => "go",
            Language::Bash => "bash",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = JobError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "python" | "py" | "interpreted-script" => Ok(Language::Python),
            "go" | "golang" | "compiled-binary-source" => Ok(Language::Go),
            "bash" | "sh" | "shell" | "shell-script" => Ok(Language::Bash),
            _ => Err(JobError::UnsupportedRuntime(tag.to_string())),
        }
    }
}

/// How to build and run one language
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RuntimeProfile {
    pub language: Language,
    pub image: String,
    pub file_name: String,
    /// Build command template; absent for languages that run their source directly
    pub build: Option<Vec<String>>,
    pub run: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl RuntimeProfile {
    pub fn builtin(language: Language) -> Self {
        let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match language {
            Language::Python => Self {
                language,
                image: "python:3.11-slim".to_string(),
                file_name: "poc.py".to_string(),
                build: None,
                run: args(&["python3", "%SOURCE%"]),
                env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            },
            Language::Go => Self {
                language,
                image: "golang:1.22-alpine".to_string(),
                file_name: "poc.go".to_string(),
                build: Some(args(&["go", "build", "-o", "%BINARY%", "%SOURCE%"])),
                run: args(&["./%BINARY%"]),
                env: vec![
                    ("GOCACHE".to_string(), "/tmp/go-cache".to_string()),
                    ("GOPATH".to_string(), "/tmp/go".to_string()),
                    ("CGO_ENABLED".to_string(), "0".to_string()),
                ],
            },
            Language::Bash => Self {
                language,
                image: "bash:5.2".to_string(),
                file_name: "poc.sh".to_string(),
                build: None,
                run: args(&["bash", "%SOURCE%"]),
                env: Vec::new(),
            },
        }
    }

    /// The staging directory is mounted read-write only when a build has to write artifacts
    pub fn writable_mount(&self) -> bool {
        self.build.is_some()
    }

    pub fn build_command(&self) -> Option<Vec<String>> {
        self.build
            .as_ref()
            .map(|template| self.apply_template(template))
    }

    pub fn run_command(&self) -> Vec<String> {
        self.apply_template(&self.run)
    }

    fn apply_template(&self, template: &[String]) -> Vec<String> {
        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%SOURCE%", &self.file_name);
        mapping.insert("%BINARY%", BINARY_NAME);
        apply_template(template, &mapping)
    }
}

/// Read-only language table shared by every job of an engine
#[derive(Debug, Clone)]
pub struct RuntimeTable {
    profiles: HashMap<Language, RuntimeProfile>,
}

impl RuntimeTable {
    pub fn builtin() -> Self {
        Self::from_profiles(Language::ALL.into_iter().map(RuntimeProfile::builtin))
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = RuntimeProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.language, p)).collect(),
        }
    }

    /// Replaces the image of a language, keeping the rest of its profile
    pub fn override_image(&mut self, language: Language, image: impl Into<String>) {
        if let Some(profile) = self.profiles.get_mut(&language) {
            profile.image = image.into();
        }
    }

    /// Maps a declared language tag to its profile
    pub fn select(&self, tag: &str) -> Result<&RuntimeProfile, JobError> {
        let language = tag.parse::<Language>()?;
        self.profiles
            .get(&language)
            .ok_or_else(|| JobError::UnsupportedRuntime(tag.to_string()))
    }

    /// Profiles sorted by language name
    pub fn profiles(&self) -> Vec<&RuntimeProfile> {
        let mut profiles: Vec<_> = self.profiles.values().collect();
        profiles.sort_by_key(|p| p.language.as_str());
        profiles
    }
}

impl Default for RuntimeTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Applies placeholder substitutions to every argument of a command template
fn apply_template(cmd_template: &[String], mapping: &HashMap<&str, &str>) -> Vec<String> {
    cmd_template
        .iter()
        .map(|s| {
            let mut t = s.clone();
            for (k, v) in mapping.iter() {
                t = t.replace(k, v);
            }
            t
        })
        .collect()
}
