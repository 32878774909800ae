// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `proc_open` and friends.
//!
//! Child pipes come back as cooperative descriptor streams, and waiting
//! for the child polls its status on a timer instead of blocking in
//! `waitpid`.

use std::fmt;
use std::os::unix::io::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use splice_rt::in_task;

use super::{arg, int_arg, with_refs};
use crate::error::CallError;
use crate::stream::fd::FdStream;
use crate::stream::StreamCell;
use crate::table::Handler;
use crate::value::Value;

/// A child started by `proc_open`.
pub struct ProcessHandle {
    pid: u32,
    command: String,
    state: Mutex<ProcState>,
}

struct ProcState {
    child: Child,
    exit: Option<ExitStatus>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Exit status, if the child has finished. Never blocks.
    pub fn try_status(&self) -> std::io::Result<Option<ExitStatus>> {
        let mut state = self.state.lock().unwrap();
        if state.exit.is_none() {
            state.exit = state.child.try_wait()?;
        }
        Ok(state.exit)
    }

    /// Wait for the child, checking every `poll`.
    pub async fn wait(&self, poll: Duration) -> std::io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.try_status()? {
                return Ok(status);
            }
            splice_rt::sleep(poll).await;
        }
    }

    pub fn signal(&self, signal: i32) -> bool {
        unsafe { libc::kill(self.pid as libc::pid_t, signal) == 0 }
    }
}

impl Drop for ProcessHandle {
    /// A child nobody closed is reaped off-thread once it exits.
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.exit.is_some() || matches!(state.child.try_wait(), Ok(Some(_))) {
            return;
        }
        let pid = self.pid as libc::pid_t;
        tracing::debug!(pid, "reaping unclosed child in the background");
        std::thread::spawn(move || unsafe {
            libc::waitpid(pid, std::ptr::null_mut(), 0);
        });
    }
}

#[derive(Debug, PartialEq)]
enum Spec {
    Inherit,
    /// `["pipe", "r"|"w"]`: mode is from the child's point of view.
    Pipe,
    /// `["file", path, mode]`
    File(String, String),
}

fn parse_spec(routine: &str, value: &Value) -> Result<Spec, CallError> {
    let Value::List(parts) = value else {
        return Ok(Spec::Inherit);
    };
    match parts.first().and_then(Value::as_str) {
        Some("pipe") => Ok(Spec::Pipe),
        Some("file") => {
            let path = parts.get(1).and_then(Value::as_str);
            let mode = parts.get(2).and_then(Value::as_str).unwrap_or("r");
            match path {
                Some(path) => Ok(Spec::File(path.to_string(), mode.to_string())),
                None => Err(CallError::invalid(routine, "file descriptor spec needs a path")),
            }
        }
        Some(other) => Err(CallError::invalid(
            routine,
            format!("{} is not a valid descriptor spec mode", other),
        )),
        None => Err(CallError::invalid(routine, "descriptor spec must start with its type")),
    }
}

fn descriptor_specs(routine: &str, value: &Value) -> Result<[Spec; 3], CallError> {
    let mut specs = [Spec::Inherit, Spec::Inherit, Spec::Inherit];
    let entries: Vec<(usize, &Value)> = match value {
        Value::List(items) => items.iter().enumerate().collect(),
        Value::Map(map) => map
            .iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
            .collect(),
        _ => return Err(CallError::invalid(routine, "descriptor spec must be an array")),
    };
    for (index, spec) in entries {
        if index > 2 {
            tracing::warn!(routine, index, "only descriptors 0, 1 and 2 can be redirected");
            continue;
        }
        specs[index] = parse_spec(routine, spec)?;
    }
    Ok(specs)
}

fn stdio_for(spec: &Spec) -> std::io::Result<Stdio> {
    Ok(match spec {
        Spec::Inherit => Stdio::inherit(),
        Spec::Pipe => Stdio::piped(),
        Spec::File(path, mode) => {
            let mut options = std::fs::OpenOptions::new();
            match mode.chars().next() {
                Some('a') => options.append(true).create(true),
                Some('w') => options.write(true).create(true).truncate(true),
                _ => options.read(true),
            };
            Stdio::from(options.open(path)?)
        }
    })
}

fn command_for(routine: &str, value: &Value) -> Result<(Command, String), CallError> {
    match value {
        Value::Str(line) => {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(line);
            Ok((cmd, line.clone()))
        }
        Value::List(argv) if !argv.is_empty() => {
            let words: Vec<&str> = argv
                .iter()
                .map(|v| {
                    v.as_str().ok_or_else(|| {
                        CallError::invalid(routine, "command arguments must be strings")
                    })
                })
                .collect::<Result<_, _>>()?;
            let mut cmd = Command::new(words[0]);
            cmd.args(&words[1..]);
            Ok((cmd, words.join(" ")))
        }
        _ => Err(CallError::invalid(routine, "command must be a string or a non-empty list")),
    }
}

fn open(args: &[Value]) -> Result<Value, CallError> {
    const NAME: &str = "proc_open";
    let (mut cmd, command) = command_for(NAME, arg(args, 0))?;
    let specs = descriptor_specs(NAME, arg(args, 1))?;
    if let Some(cwd) = arg(args, 3).as_str() {
        cmd.current_dir(cwd);
    }
    if let Value::Map(env) = arg(args, 4) {
        cmd.env_clear();
        for (key, value) in env {
            if let Some(v) = value.as_str() {
                cmd.env(key, v);
            }
        }
    }

    let stdio = |i: usize| stdio_for(&specs[i]).map_err(|e| CallError::stream(NAME, e.into()));
    cmd.stdin(stdio(0)?).stdout(stdio(1)?).stderr(stdio(2)?);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(routine = NAME, error = %e, "could not start child");
            return Ok(Value::Bool(false));
        }
    };

    let fds: [Option<OwnedFd>; 3] = [
        child.stdin.take().map(OwnedFd::from),
        child.stdout.take().map(OwnedFd::from),
        child.stderr.take().map(OwnedFd::from),
    ];
    let mut pipes = IndexMap::new();
    for (index, fd) in fds.into_iter().enumerate() {
        if let Some(fd) = fd {
            let stream = FdStream::owned(fd, true).map_err(|e| CallError::stream(NAME, e.into()))?;
            pipes.insert(index.to_string(), Value::Stream(StreamCell::new(stream)));
        }
    }

    let handle = ProcessHandle {
        pid: child.id(),
        command,
        state: Mutex::new(ProcState { child, exit: None }),
    };
    tracing::debug!(pid = handle.pid, "child started");
    Ok(with_refs(Value::Process(Arc::new(handle)), vec![("pipes", Value::Map(pipes))]))
}

fn process(routine: &str, args: &[Value]) -> Result<Arc<ProcessHandle>, CallError> {
    match arg(args, 0) {
        Value::Process(p) => Ok(p.clone()),
        other => Err(CallError::invalid(
            routine,
            format!("argument #1 must be a process, got {}", other.type_name()),
        )),
    }
}

fn status_value(handle: &ProcessHandle, status: Option<ExitStatus>) -> Value {
    let mut map = IndexMap::new();
    map.insert("command".to_string(), Value::from(handle.command()));
    map.insert("pid".to_string(), Value::Int(handle.pid() as i64));
    map.insert("running".to_string(), Value::Bool(status.is_none()));
    let signal = status.and_then(|s| s.signal());
    map.insert("signaled".to_string(), Value::Bool(signal.is_some()));
    let stop = status.and_then(|s| s.stopped_signal());
    map.insert("stopped".to_string(), Value::Bool(stop.is_some()));
    let code = status.and_then(|s| s.code()).map_or(-1, i64::from);
    map.insert("exitcode".to_string(), Value::Int(code));
    map.insert("termsig".to_string(), Value::Int(signal.map_or(0, i64::from)));
    map.insert("stopsig".to_string(), Value::Int(stop.map_or(0, i64::from)));
    Value::Map(map)
}

async fn dispatch(
    name: &'static str,
    args: Vec<Value>,
    poll: Duration,
) -> Result<Value, CallError> {
    match name {
        "proc_open" => open(&args),
        "proc_close" => {
            let handle = process(name, &args)?;
            match handle.wait(poll).await {
                Ok(status) => Ok(Value::Int(status.code().map_or(-1, i64::from))),
                Err(e) => {
                    tracing::warn!(routine = name, error = %e, "waiting for child failed");
                    Ok(Value::Int(-1))
                }
            }
        }
        "proc_get_status" => {
            let handle = process(name, &args)?;
            let status = handle.try_status().map_err(|e| CallError::stream(name, e.into()))?;
            Ok(status_value(&handle, status))
        }
        "proc_terminate" => {
            let handle = process(name, &args)?;
            let signal = if arg(&args, 1).is_null() {
                i64::from(libc::SIGTERM)
            } else {
                int_arg(name, &args, 1)?
            };
            match i32::try_from(signal) {
                Ok(signal) => Ok(Value::Bool(handle.signal(signal))),
                Err(_) => {
                    tracing::warn!(routine = name, signal, "signal number out of range");
                    Ok(Value::Bool(false))
                }
            }
        }
        _ => Err(CallError::Undefined(name.to_string())),
    }
}

pub fn handler(name: &str, original: Handler, poll: Duration) -> Option<Handler> {
    let name = crate::catalog::PROC.iter().copied().find(|n| *n == name)?;
    Some(Handler::new(move |args| {
        let original = original.clone();
        async move {
            if !in_task() {
                return original.call(args).await;
            }
            dispatch(name, args, poll).await
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_rt::{Worker, WorkerCensus};

    fn call(name: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let original = Handler::sync(|_| Err(CallError::failed("original", "should not run")));
        let h = handler(name, original, Duration::from_millis(1)).unwrap();
        Worker::with_census(&WorkerCensus::new()).unwrap().block_on(h.call(args))
    }

    fn field(v: &Value, key: &str) -> Value {
        match v {
            Value::Map(m) => m.get(key).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    fn pipe_spec() -> Value {
        Value::List(vec![Value::from("pipe"), Value::from("w")])
    }

    #[test]
    fn specs_parse() {
        let specs = descriptor_specs(
            "proc_open",
            &Value::List(vec![
                Value::Null,
                pipe_spec(),
                Value::List(vec![Value::from("file"), Value::from("/dev/null"), Value::from("a")]),
            ]),
        )
        .unwrap();
        assert_eq!(specs, [Spec::Inherit, Spec::Pipe, Spec::File("/dev/null".into(), "a".into())]);
        assert!(parse_spec("proc_open", &Value::List(vec![Value::from("socket")])).is_err());
    }

    #[test]
    fn child_output_arrives_through_pipe() {
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let (out, code) = worker.block_on(async {
            let poll = Duration::from_millis(1);
            let open = handler("proc_open", Handler::sync(|_| Ok(Value::Null)), poll).unwrap();
            let close = handler("proc_close", Handler::sync(|_| Ok(Value::Null)), poll).unwrap();
            let opened = open
                .call(vec![
                    Value::from("printf hello; exit 3"),
                    Value::List(vec![Value::Null, pipe_spec()]),
                ])
                .await
                .unwrap();
            let proc = field(&opened, "return");
            let stdout = field(&field(&opened, "pipes"), "1");
            let stdout = stdout.as_stream().unwrap();
            let mut out = Vec::new();
            loop {
                let chunk = stdout.read(64).await.unwrap();
                if chunk.is_empty() {
                    break;
                }
                out.extend(chunk);
            }
            (out, close.call(vec![proc]).await.unwrap())
        });
        assert_eq!(out, b"hello");
        assert_eq!(code, Value::Int(3));
    }

    #[test]
    fn terminate_and_status() {
        let opened = call("proc_open", vec![Value::from("sleep 5"), Value::List(vec![])]).unwrap();
        let proc = field(&opened, "return");
        let status = call("proc_get_status", vec![proc.clone()]).unwrap();
        assert_eq!(field(&status, "running"), Value::Bool(true));
        assert_eq!(field(&status, "command"), Value::from("sleep 5"));

        assert_eq!(call("proc_terminate", vec![proc.clone()]), Ok(Value::Bool(true)));
        assert_eq!(call("proc_close", vec![proc.clone()]), Ok(Value::Int(-1)));
        let status = call("proc_get_status", vec![proc]).unwrap();
        assert_eq!(field(&status, "signaled"), Value::Bool(true));
        assert_eq!(field(&status, "termsig"), Value::Int(libc::SIGTERM as i64));
    }

    #[test]
    fn out_of_range_signal_is_refused() {
        let opened = call("proc_open", vec![Value::from("sleep 5"), Value::List(vec![])]).unwrap();
        let proc = field(&opened, "return");
        let huge = Value::Int(i64::from(libc::SIGTERM) + (1 << 32));
        assert_eq!(call("proc_terminate", vec![proc.clone(), huge]), Ok(Value::Bool(false)));
        let status = call("proc_get_status", vec![proc.clone()]).unwrap();
        assert_eq!(field(&status, "running"), Value::Bool(true));

        assert_eq!(call("proc_terminate", vec![proc.clone()]), Ok(Value::Bool(true)));
        call("proc_close", vec![proc]).unwrap();
    }

    #[test]
    fn dropping_an_unclosed_child_reaps_it() {
        let opened =
            call("proc_open", vec![Value::from("sleep 0.05"), Value::List(vec![])]).unwrap();
        let status = call("proc_get_status", vec![field(&opened, "return")]).unwrap();
        let Value::Int(pid) = field(&status, "pid") else { panic!("no pid") };
        drop(opened);

        // A zombie keeps its /proc entry until someone waits for it.
        let entry = format!("/proc/{}/stat", pid);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::path::Path::new(&entry).exists() {
            assert!(std::time::Instant::now() < deadline, "child {} never reaped", pid);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn wrong_argument_type() {
        assert!(matches!(
            call("proc_get_status", vec![Value::Int(1)]),
            Err(CallError::InvalidArgument { .. })
        ));
    }
}
