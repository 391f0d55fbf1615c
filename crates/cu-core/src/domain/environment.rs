//! Environment identity, persisted metadata, and execution values.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cu_engine::EngineError;
use cu_state::ObjectId;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::config::EnvironmentConfig;
use super::error::{CuError, Result};

/// Namespace holding one branch per live environment.
pub const BRANCH_PREFIX: &str = "refs/heads/container-use/";

/// Namespace holding one marker per deleted environment id.
pub const RETIRED_PREFIX: &str = "refs/container-use/retired/";

/// Commit-message trailer carrying [`EnvironmentState`] as JSON.
pub const STATE_TRAILER: &str = "Container-Use-State";

pub const DEFAULT_SHELL: &str = "sh";

const ADJECTIVES: &[&str] = &[
    "adaptive", "amber", "brave", "brisk", "calm", "clever", "cosmic", "crisp", "daring", "eager",
    "fair", "gentle", "golden", "humble", "jolly", "keen", "lively", "lucid", "mellow", "nimble",
    "noble", "patient", "quiet", "rapid", "rustic", "sharp", "steady", "sunny", "swift", "tidy",
    "vivid", "witty",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "bison", "crane", "dingo", "falcon", "ferret", "gecko", "heron", "ibis",
    "jackal", "koala", "lemur", "lynx", "marmot", "moose", "newt", "ocelot", "otter", "panda",
    "puffin", "quokka", "raven", "salmon", "stoat", "tapir", "toucan", "viper", "walrus", "wombat",
    "yak", "zebra",
];

fn id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").ok())
        .as_ref()
}

/// Human-memorable environment identifier, e.g. `adaptive-koala`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvironmentId(String);

impl EnvironmentId {
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = id_pattern().map(|re| re.is_match(raw)).unwrap_or(false);
        if !valid {
            return Err(CuError::InvalidEnvironmentId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// A fresh random `<adjective>-<animal>` id.
    pub fn generate() -> Self {
        let bytes = uuid::Uuid::new_v4().into_bytes();
        let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
        let animal = ANIMALS[bytes[1] as usize % ANIMALS.len()];
        Self(format!("{adjective}-{animal}"))
    }

    /// `self` with a numeric suffix, used when the plain id is taken.
    pub fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}-{n}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn branch_ref(&self) -> String {
        format!("{BRANCH_PREFIX}{}", self.0)
    }

    pub fn retired_ref(&self) -> String {
        format!("{RETIRED_PREFIX}{}", self.0)
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EnvironmentId {
    type Err = CuError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s.trim())
    }
}

impl TryFrom<String> for EnvironmentId {
    type Error = CuError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<EnvironmentId> for String {
    fn from(id: EnvironmentId) -> Self {
        id.0
    }
}

/// Metadata persisted with every environment commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub config: EnvironmentConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnvironmentState {
    pub fn new(title: &str, description: &str, config: EnvironmentConfig) -> Self {
        let now = Utc::now();
        Self {
            title: title.to_string(),
            description: description.to_string(),
            config,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touched(&self) -> Self {
        Self {
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Render as a single trailer line.
    pub fn to_trailer(&self) -> Result<String> {
        Ok(format!("{STATE_TRAILER}: {}", serde_json::to_string(self)?))
    }

    /// Recover the state from a commit message. The last matching trailer wins.
    pub fn from_commit_message(message: &str) -> std::result::Result<Self, String> {
        let prefix = format!("{STATE_TRAILER}: ");
        let raw = message
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix(&prefix))
            .ok_or_else(|| format!("missing {STATE_TRAILER} trailer"))?;
        serde_json::from_str(raw).map_err(|e| format!("unreadable {STATE_TRAILER} trailer: {e}"))
    }
}

/// Assemble a commit message ending in the state trailer.
pub fn compose_commit_message(subject: &str, body: &str, state: &EnvironmentState) -> Result<String> {
    let mut message = String::from(subject.trim());
    if !body.trim().is_empty() {
        message.push_str("\n\n");
        message.push_str(body.trim_end());
    }
    message.push_str("\n\n");
    message.push_str(&state.to_trailer()?);
    message.push('\n');
    Ok(message)
}

/// What one command execution produced. Not persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// `` `cmd` (exit N) `` with the command collapsed onto one line.
    pub fn summary(&self) -> String {
        let command = self.command.split_whitespace().collect::<Vec<_>>().join(" ");
        format!("`{command}` (exit {})", self.exit_code)
    }
}

/// A command to run inside an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub command: String,
    pub shell: String,
    /// Hand the command to the image entrypoint instead of `shell -c`.
    pub use_entrypoint: bool,
    pub timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: DEFAULT_SHELL.to_string(),
            use_entrypoint: false,
            timeout: None,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_entrypoint(mut self, use_entrypoint: bool) -> Self {
        self.use_entrypoint = use_entrypoint;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The argv handed to the engine.
    pub fn argv(&self) -> Result<Vec<String>> {
        if self.use_entrypoint {
            let words = shell_words::split(&self.command)
                .map_err(|e| CuError::ExecutionEngine(EngineError::InvalidCommand(e.to_string())))?;
            if words.is_empty() {
                return Err(CuError::ExecutionEngine(EngineError::InvalidCommand(
                    "empty command".to_string(),
                )));
            }
            return Ok(words);
        }
        let shell = if self.shell.trim().is_empty() {
            DEFAULT_SHELL
        } else {
            self.shell.as_str()
        };
        Ok(vec![shell.to_string(), "-c".to_string(), self.command.clone()])
    }
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSummary {
    pub id: EnvironmentId,
    pub title: String,
    pub head_commit: ObjectId,
    pub updated_at: DateTime<Utc>,
}
