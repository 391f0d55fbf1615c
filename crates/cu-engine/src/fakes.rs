//! In-memory fake for `ContainerEngine` (testing only)
//!
//! `MemoryEngine` keeps each container's working directory as an
//! [`FsSnapshot`] and runs commands through a tiny shell interpreter that
//! understands the handful of builtins tests need (`echo`, `cat`, `rm`,
//! `touch`, `printenv`, `exit`, `sleep`, redirection, `;`, `&&`, `||`).
//! Anything else exits 127 the way `sh` does for a missing command.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cu_state::{FsEntry, FsSnapshot};

use crate::client::{
    ContainerEngine, ContainerId, ContainerSpec, EngineSession, ExecOutput, ExecRequest,
};
use crate::error::EngineError;
use crate::Result;

/// One observed exec call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub container: String,
    pub argv: Vec<String>,
    pub workdir: String,
}

#[derive(Debug)]
struct FakeContainer {
    spec: ContainerSpec,
    fs: FsSnapshot,
}

#[derive(Debug, Default)]
struct EngineState {
    unreachable: bool,
    missing_images: HashSet<String>,
    entrypoints: HashMap<String, Vec<String>>,
    fail_exports: bool,
    containers: BTreeMap<String, FakeContainer>,
    next_id: u64,
    created: usize,
    execs: Vec<ExecRecord>,
}

/// In-memory container engine. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `connect` fails with `DaemonUnreachable`.
    pub fn unreachable(self) -> Self {
        self.lock().unreachable = true;
        self
    }

    /// Creating a container from `image` fails with `ImagePull`.
    pub fn with_missing_image(self, image: &str) -> Self {
        self.lock().missing_images.insert(image.to_string());
        self
    }

    /// Entrypoint prepended when an exec asks for it.
    pub fn with_entrypoint(self, image: &str, entrypoint: &[&str]) -> Self {
        self.lock().entrypoints.insert(
            image.to_string(),
            entrypoint.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    /// Make every subsequent `export` fail.
    pub fn fail_exports(&self, fail: bool) {
        self.lock().fail_exports = fail;
    }

    /// Containers created and not yet removed.
    pub fn live_containers(&self) -> usize {
        self.lock().containers.len()
    }

    /// Containers created over the engine's lifetime.
    pub fn created_containers(&self) -> usize {
        self.lock().created
    }

    pub fn exec_log(&self) -> Vec<ExecRecord> {
        self.lock().execs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn EngineSession>> {
        if self.lock().unreachable {
            return Err(EngineError::DaemonUnreachable {
                engine: "memory".to_string(),
                detail: "daemon stopped".to_string(),
            });
        }
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            owned: Mutex::new(HashSet::new()),
        }))
    }
}

/// Session over a [`MemoryEngine`]. Containers it still owns are removed
/// when it is dropped.
#[derive(Debug)]
pub struct MemorySession {
    state: Arc<Mutex<EngineState>>,
    owned: Mutex<HashSet<String>>,
}

impl MemorySession {
    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, container: &ContainerId) {
        self.owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&container.0);
        self.lock().containers.remove(&container.0);
    }

    async fn run_script(&self, container: &ContainerId, script: &str) -> Result<ExecOutput> {
        let mut out = ExecOutput::default();
        let mut last = 0;

        for step in split_statements(script) {
            let proceed = match step.connector {
                Connector::Always => true,
                Connector::OnSuccess => last == 0,
                Connector::OnFailure => last != 0,
            };
            if !proceed {
                continue;
            }

            let words = shell_words::split(&step.text)
                .map_err(|e| EngineError::InvalidCommand(e.to_string()))?;
            if words.is_empty() {
                continue;
            }

            if words[0] == "sleep" {
                let secs: f64 = words.get(1).and_then(|s| s.parse().ok()).unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
                last = 0;
                continue;
            }

            let mut state = self.lock();
            let ctr = state
                .containers
                .get_mut(&container.0)
                .ok_or_else(|| EngineError::ContainerNotFound(container.0.clone()))?;
            match builtin(ctr, words, &mut out) {
                Flow::Next(code) => last = code,
                Flow::Exit(code) => {
                    out.exit_code = code;
                    return Ok(out);
                }
            }
        }

        out.exit_code = last;
        Ok(out)
    }
}

#[async_trait]
impl EngineSession for MemorySession {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let mut state = self.lock();
        if state.missing_images.contains(&spec.image) {
            return Err(EngineError::ImagePull {
                image: spec.image.clone(),
                detail: "manifest unknown".to_string(),
            });
        }
        state.next_id += 1;
        state.created += 1;
        let id = format!("fake-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                fs: FsSnapshot::new(),
            },
        );
        drop(state);

        self.owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone());
        Ok(ContainerId(id))
    }

    async fn copy_in(
        &self,
        container: &ContainerId,
        dest: &str,
        snapshot: &FsSnapshot,
    ) -> Result<()> {
        let mut state = self.lock();
        let ctr = state
            .containers
            .get_mut(&container.0)
            .ok_or_else(|| EngineError::ContainerNotFound(container.0.clone()))?;
        let prefix = container_path(&ctr.spec.workdir, dest).unwrap_or_default();
        for (path, entry) in snapshot.iter() {
            let target = if prefix.is_empty() {
                path.to_string()
            } else {
                format!("{prefix}/{path}")
            };
            ctr.fs.insert(&target, entry.clone())?;
        }
        Ok(())
    }

    async fn exec(&self, container: &ContainerId, request: &ExecRequest) -> Result<ExecOutput> {
        if request.argv.is_empty() {
            return Err(EngineError::InvalidCommand("empty command".to_string()));
        }

        let argv = {
            let mut state = self.lock();
            let image = state
                .containers
                .get(&container.0)
                .map(|c| c.spec.image.clone())
                .ok_or_else(|| EngineError::ContainerNotFound(container.0.clone()))?;
            let mut argv = Vec::new();
            if request.use_entrypoint {
                argv.extend(state.entrypoints.get(&image).cloned().unwrap_or_default());
            }
            argv.extend(request.argv.iter().cloned());
            state.execs.push(ExecRecord {
                container: container.0.clone(),
                argv: argv.clone(),
                workdir: request.workdir.clone(),
            });
            argv
        };

        let script = if argv.len() >= 3 && argv[1] == "-c" {
            argv[2].clone()
        } else {
            shell_words::join(&argv)
        };

        let pending = self.run_script(container, &script);
        match request.timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| EngineError::Timeout {
                    limit_ms: limit.as_millis() as u64,
                })?,
            None => pending.await,
        }
    }

    async fn export(&self, container: &ContainerId, path: &str) -> Result<FsSnapshot> {
        let state = self.lock();
        if state.fail_exports {
            return Err(EngineError::Command {
                engine: "memory".to_string(),
                command: "cp".to_string(),
                stderr: "export failed".to_string(),
            });
        }
        let ctr = state
            .containers
            .get(&container.0)
            .ok_or_else(|| EngineError::ContainerNotFound(container.0.clone()))?;

        let prefix = container_path(&ctr.spec.workdir, path).unwrap_or_default();
        if prefix.is_empty() {
            return Ok(ctr.fs.clone());
        }
        let mut exported = FsSnapshot::new();
        let scope = format!("{prefix}/");
        for (entry_path, entry) in ctr.fs.iter() {
            if let Some(rest) = entry_path.strip_prefix(&scope) {
                exported.insert(rest, entry.clone())?;
            }
        }
        Ok(exported)
    }

    async fn remove(&self, container: &ContainerId) -> Result<()> {
        self.release(container);
        Ok(())
    }

    fn discard(&self, container: &ContainerId) {
        self.release(container);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let owned: Vec<String> = self
            .owned
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for id in owned {
            state.containers.remove(&id);
        }
    }
}

/// Map a container path onto the workdir-relative snapshot namespace.
/// Paths outside the workdir are not tracked.
fn container_path(workdir: &str, path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return Some(path.trim_end_matches('/').to_string());
    }
    let root = workdir.trim_end_matches('/');
    if path.trim_end_matches('/') == root {
        return Some(String::new());
    }
    path.strip_prefix(&format!("{root}/"))
        .map(|rest| rest.trim_end_matches('/').to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connector {
    Always,
    OnSuccess,
    OnFailure,
}

#[derive(Debug)]
struct Statement {
    connector: Connector,
    text: String,
}

/// Split on unquoted `;`, newlines, `&&` and `||`.
fn split_statements(script: &str) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut connector = Connector::Always;
    let mut quote: Option<char> = None;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some('"'), '\\') => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, ';' | '\n') => {
                statements.push(Statement {
                    connector,
                    text: std::mem::take(&mut current),
                });
                connector = Connector::Always;
            }
            (None, '&') if chars.peek() == Some(&'&') => {
                chars.next();
                statements.push(Statement {
                    connector,
                    text: std::mem::take(&mut current),
                });
                connector = Connector::OnSuccess;
            }
            (None, '|') if chars.peek() == Some(&'|') => {
                chars.next();
                statements.push(Statement {
                    connector,
                    text: std::mem::take(&mut current),
                });
                connector = Connector::OnFailure;
            }
            (None, c) => current.push(c),
        }
    }
    statements.push(Statement {
        connector,
        text: current,
    });

    statements.retain(|s| !s.text.trim().is_empty());
    statements
}

enum Flow {
    Next(i32),
    Exit(i32),
}

enum Sink {
    Stdout,
    Stderr,
    Null,
    File { path: String, append: bool },
}

/// Pull redirections out of the word list.
fn take_redirect(words: Vec<String>) -> (Vec<String>, Sink) {
    let mut args = Vec::new();
    let mut sink = Sink::Stdout;
    let mut iter = words.into_iter();

    while let Some(word) = iter.next() {
        if word == ">&2" || word == "1>&2" {
            sink = Sink::Stderr;
        } else if let Some(rest) = word.strip_prefix("2>") {
            // stderr redirection; consume the target and keep stderr as is
            if rest.is_empty() {
                iter.next();
            }
        } else if let Some(rest) = word.strip_prefix(">>") {
            let target = if rest.is_empty() { iter.next() } else { Some(rest.to_string()) };
            sink = file_sink(target, true);
        } else if let Some(rest) = word.strip_prefix('>') {
            let target = if rest.is_empty() { iter.next() } else { Some(rest.to_string()) };
            sink = file_sink(target, false);
        } else {
            args.push(word);
        }
    }
    (args, sink)
}

fn file_sink(target: Option<String>, append: bool) -> Sink {
    match target {
        Some(path) if path == "/dev/null" => Sink::Null,
        Some(path) => Sink::File { path, append },
        None => Sink::Null,
    }
}

fn builtin(ctr: &mut FakeContainer, words: Vec<String>, out: &mut ExecOutput) -> Flow {
    let (args, sink) = take_redirect(words);
    let Some((cmd, rest)) = args.split_first() else {
        return Flow::Next(0);
    };

    let mut produced = String::new();
    let mut code = 0;
    let workdir = ctr.spec.workdir.clone();

    match cmd.as_str() {
        "true" | ":" => {}
        "false" => code = 1,
        "exit" => {
            let status = rest.first().and_then(|s| s.parse().ok()).unwrap_or(0);
            return Flow::Exit(status);
        }
        "echo" => {
            let (newline, words) = match rest.first().map(String::as_str) {
                Some("-n") => (false, &rest[1..]),
                _ => (true, rest),
            };
            produced.push_str(&words.join(" "));
            if newline {
                produced.push('\n');
            }
        }
        "printf" => {
            if let Some((format, values)) = rest.split_first() {
                let mut text = format.replace("\\n", "\n").replace("\\t", "\t");
                for value in values {
                    text = text.replacen("%s", value, 1);
                }
                produced.push_str(&text);
            }
        }
        "pwd" => {
            produced.push_str(&workdir);
            produced.push('\n');
        }
        "printenv" => match rest.first() {
            Some(name) => match ctr.spec.env.get(name) {
                Some(value) => {
                    produced.push_str(value);
                    produced.push('\n');
                }
                None => code = 1,
            },
            None => {
                for (key, value) in &ctr.spec.env {
                    produced.push_str(&format!("{key}={value}\n"));
                }
            }
        },
        "cat" => {
            for path in rest {
                match container_path(&workdir, path).and_then(|p| ctr.fs.read_file(&p).map(<[u8]>::to_vec)) {
                    Some(data) => produced.push_str(&String::from_utf8_lossy(&data)),
                    None => {
                        out.stderr
                            .push_str(&format!("cat: {path}: No such file or directory\n"));
                        code = 1;
                    }
                }
            }
        }
        "ls" => {
            for (path, _) in ctr.fs.iter() {
                produced.push_str(path);
                produced.push('\n');
            }
        }
        "touch" => {
            for path in rest {
                if let Some(p) = container_path(&workdir, path) {
                    if ctr.fs.get(&p).is_none() && ctr.fs.insert_file(&p, Vec::new()).is_err() {
                        code = 1;
                    }
                }
            }
        }
        "mkdir" => {}
        "rm" => {
            let force = rest.iter().any(|a| a.starts_with('-') && a.contains('f'));
            for path in rest.iter().filter(|a| !a.starts_with('-')) {
                let removed = container_path(&workdir, path)
                    .map(|p| remove_tree(&mut ctr.fs, &p))
                    .unwrap_or(0);
                if removed == 0 && !force {
                    out.stderr.push_str(&format!(
                        "rm: cannot remove '{path}': No such file or directory\n"
                    ));
                    code = 1;
                }
            }
        }
        "chmod" => {
            if let Some((mode, paths)) = rest.split_first() {
                let executable = match mode.as_str() {
                    "+x" | "a+x" | "u+x" => Some(true),
                    "-x" | "a-x" | "u-x" => Some(false),
                    octal => octal
                        .chars()
                        .rev()
                        .nth(2)
                        .and_then(|c| c.to_digit(8))
                        .map(|owner| owner & 1 == 1),
                };
                for path in paths {
                    let target = container_path(&workdir, path);
                    let current = target.as_deref().and_then(|p| ctr.fs.get(p)).cloned();
                    match (target, current, executable) {
                        (Some(p), Some(FsEntry::File { data, .. }), Some(executable)) => {
                            if ctr.fs.insert(&p, FsEntry::File { data, executable }).is_err() {
                                code = 1;
                            }
                        }
                        _ => code = 1,
                    }
                }
            }
        }
        "ln" => {
            let operands: Vec<&String> = rest.iter().filter(|a| !a.starts_with('-')).collect();
            match (operands.first(), operands.get(1)) {
                (Some(target), Some(name)) => {
                    let link = FsEntry::Symlink {
                        target: target.to_string(),
                    };
                    match container_path(&workdir, name) {
                        Some(p) if ctr.fs.insert(&p, link).is_ok() => {}
                        _ => code = 1,
                    }
                }
                _ => code = 1,
            }
        }
        "cp" | "mv" => match (rest.first(), rest.get(1)) {
            (Some(from), Some(to)) => {
                let source = container_path(&workdir, from);
                let entry = source.as_deref().and_then(|p| ctr.fs.get(p)).cloned();
                match (entry, container_path(&workdir, to)) {
                    (Some(entry), Some(dest)) => {
                        if cmd == "mv" {
                            if let Some(p) = &source {
                                ctr.fs.remove(p);
                            }
                        }
                        if ctr.fs.insert(&dest, entry).is_err() {
                            code = 1;
                        }
                    }
                    _ => {
                        out.stderr
                            .push_str(&format!("{cmd}: cannot stat '{from}': No such file or directory\n"));
                        code = 1;
                    }
                }
            }
            _ => code = 1,
        },
        other => {
            out.stderr.push_str(&format!("sh: 1: {other}: not found\n"));
            code = 127;
        }
    }

    match sink {
        Sink::Stdout => out.stdout.push_str(&produced),
        Sink::Stderr => out.stderr.push_str(&produced),
        Sink::Null => {}
        Sink::File { path, append } => match container_path(&workdir, &path) {
            Some(p) => {
                let (mut data, executable) = match ctr.fs.get(&p) {
                    Some(FsEntry::File { data, executable }) if append => {
                        (data.clone(), *executable)
                    }
                    Some(FsEntry::File { executable, .. }) => (Vec::new(), *executable),
                    _ => (Vec::new(), false),
                };
                data.extend_from_slice(produced.as_bytes());
                if ctr.fs.insert(&p, FsEntry::File { data, executable }).is_err() {
                    code = 1;
                }
            }
            None => {}
        },
    }

    Flow::Next(code)
}

/// Remove `path` and everything below it. Returns how many entries went.
fn remove_tree(fs: &mut FsSnapshot, path: &str) -> usize {
    let scope = format!("{path}/");
    let doomed: Vec<String> = fs
        .iter()
        .map(|(p, _)| p)
        .filter(|p| *p == path || p.starts_with(&scope))
        .map(str::to_string)
        .collect();
    for p in &doomed {
        fs.remove(p);
    }
    doomed.len()
}
