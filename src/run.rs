//! The run pipeline: step construction and the compile-then-run supervisor.
//!
//! A run is two sequential steps. Each step spawns one child under the
//! jail prefix and attaches four concurrent forwarders: stdin writer,
//! stdout reader, stderr reader, and the status wait. The step is done
//! only when all of them have wound down; the wait itself carries a
//! two-stage time limit (SIGXCPU, then SIGKILL after a grace window).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

use crate::config::{Compiler, JailConfig, Switch};
use crate::error::SessionError;
use crate::jail::{self, JailedChild, signal_name};
use crate::limits::OutputLimiter;
use crate::session::{field, text_field};
use crate::writer::FrameSender;

/// Pipe read chunk size for the output forwarders.
const FORWARD_BUF_SIZE: usize = 8192;
/// Exit status reported when the jail wrapper itself cannot be exec'd.
const SPAWN_FAILURE_CODE: i32 = 127;

/// One sequential stage of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandStep {
    pub(crate) argv: Vec<String>,
    /// Received field fed to the child's stdin.
    pub(crate) stdin_field: &'static str,
    pub(crate) stdout_command: &'static str,
    pub(crate) stderr_command: &'static str,
    /// Seconds before the soft kill fires.
    pub(crate) soft_kill_wait: u64,
}

/// Final wait status of a step, split the way the wire reports it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepStatus {
    pub(crate) code: Option<i32>,
    pub(crate) signal: Option<i32>,
}

impl StepStatus {
    fn from_exit(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Build the compile and run steps for `compiler`: splice the client's
/// selected switches and raw options into the argv, then prefix the jail
/// wrapper command.
pub(crate) fn build_steps(
    compiler: &Compiler,
    jail: &JailConfig,
    switches: &HashMap<String, Switch>,
    received: &[(String, Vec<u8>)],
) -> [CommandStep; 2] {
    let mut compile_argv = compiler.compile_command.clone();
    let mut run_argv = compiler.run_command.clone();

    if let Some(selection) = text_field(received, "CompilerOption") {
        let selected: HashSet<&str> = selection
            .split([',', '\n'])
            .filter(|id| !id.is_empty())
            .collect();
        // Only ids on the compiler's allow-list count, in allow-list order;
        // anything else the client asked for is dropped.
        for id in &compiler.switches {
            if !selected.contains(id.as_str()) {
                continue;
            }
            let Some(switch) = switches.get(id) else {
                continue;
            };
            let argv = if switch.runtime {
                &mut run_argv
            } else {
                &mut compile_argv
            };
            splice(argv, &switch.flags, switch.insert_position);
        }
    }

    if let Some(raw) = text_field(received, "CompilerOptionRaw") {
        compile_argv.extend(split_raw_options(&raw));
    }
    if let Some(raw) = text_field(received, "RuntimeOptionRaw") {
        run_argv.extend(split_raw_options(&raw));
    }

    let prefixed = |argv: Vec<String>| {
        let mut full = jail.jail_command.clone();
        full.extend(argv);
        full
    };

    [
        CommandStep {
            argv: prefixed(compile_argv),
            stdin_field: "",
            stdout_command: "CompilerMessageS",
            stderr_command: "CompilerMessageE",
            soft_kill_wait: jail.compile_time_limit,
        },
        CommandStep {
            argv: prefixed(run_argv),
            stdin_field: "StdIn",
            stdout_command: "StdOut",
            stderr_command: "StdErr",
            soft_kill_wait: jail.program_duration,
        },
    ]
}

fn splice(argv: &mut Vec<String>, flags: &[String], insert_position: usize) {
    if insert_position == 0 {
        argv.extend(flags.iter().cloned());
    } else {
        let at = insert_position.min(argv.len());
        argv.splice(at..at, flags.iter().cloned());
    }
}

/// Split a raw-option field on line endings, dropping one trailing empty
/// token (the common case of a terminating newline).
fn split_raw_options(raw: &str) -> Vec<String> {
    let normalized = raw.replace("\r\n", "\n");
    let mut parts: Vec<String> = normalized.split(['\r', '\n']).map(str::to_string).collect();
    if parts.last().is_some_and(String::is_empty) {
        parts.pop();
    }
    parts
}

/// Execute the steps in order, wrapped in the `Control Start` /
/// `ExitCode`-or-`Signal` / `Control Finish` frame protocol. A step that
/// does not exit cleanly ends the run and becomes the terminal status.
pub(crate) async fn run_steps(
    steps: [CommandStep; 2],
    workdir: &Path,
    received: &[(String, Vec<u8>)],
    jail: &JailConfig,
    sender: &FrameSender,
) -> Result<(), SessionError> {
    sender.send("Control", "Start").await?;

    let limiter = Arc::new(OutputLimiter::new(
        jail.output_limit_warn,
        jail.output_limit_kill,
    ));
    let mut last_status = None;

    for step in steps {
        let stdin_blob = field(received, step.stdin_field)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let status = run_step(&step, workdir, stdin_blob, jail.kill_wait, sender, &limiter).await?;
        let ok = status.success();
        last_status = Some(status);
        if !ok {
            break;
        }
    }

    if let Some(status) = last_status {
        if let Some(code) = status.code {
            sender.send("ExitCode", code.to_string()).await?;
        } else if let Some(signo) = status.signal {
            sender.send("Signal", signal_name(signo)).await?;
        }
    }
    sender.send("Control", "Finish").await
}

async fn run_step(
    step: &CommandStep,
    workdir: &Path,
    stdin_blob: Vec<u8>,
    kill_wait: u64,
    sender: &FrameSender,
    limiter: &Arc<OutputLimiter>,
) -> Result<StepStatus, SessionError> {
    debug!(argv = ?step.argv, "starting step");
    let spawned = match jail::spawn_in_dir(workdir, &step.argv) {
        Ok(spawned) => spawned,
        Err(e) => {
            // The wrapper could not be exec'd; report it like a failed
            // child rather than tearing the connection down.
            warn!(error = %e, argv = ?step.argv, "failed to spawn step");
            return Ok(StepStatus {
                code: Some(SPAWN_FAILURE_CODE),
                signal: None,
            });
        }
    };
    let JailedChild {
        mut child,
        mut stdin,
        stdout,
        stderr,
        handle,
    } = spawned;
    limiter.attach(&handle);

    let stdin_task = tokio::spawn(async move {
        let _ = stdin.write_all(&stdin_blob).await;
        let _ = stdin.shutdown().await;
    });
    let stdout_task = tokio::spawn(forward_output(
        stdout,
        sender.clone(),
        step.stdout_command,
        Arc::clone(limiter),
    ));
    let stderr_task = tokio::spawn(forward_output(
        stderr,
        sender.clone(),
        step.stderr_command,
        Arc::clone(limiter),
    ));

    let soft_window = Duration::from_secs(step.soft_kill_wait);
    let status = match timeout(soft_window, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            debug!(limit = step.soft_kill_wait, "soft time limit hit, sending SIGXCPU");
            handle.kill(libc::SIGXCPU);
            match timeout(Duration::from_secs(kill_wait), child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    debug!("grace window expired, sending SIGKILL");
                    handle.kill(libc::SIGKILL);
                    child.wait().await?
                }
            }
        }
    };
    handle.mark_finished();

    // Step rendezvous: every forwarder winds down before the status is
    // trusted and the next step may start.
    let _ = tokio::join!(stdin_task, stdout_task, stderr_task);

    debug!(output_bytes = limiter.total(), "step finished");
    Ok(StepStatus::from_exit(status))
}

/// Move child output to the client in chunks, feeding the byte limiter.
async fn forward_output<R>(
    mut pipe: R,
    sender: FrameSender,
    command: &'static str,
    limiter: Arc<OutputLimiter>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FORWARD_BUF_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                limiter.add(n);
                if sender.send(command, &buf[..n]).await.is_err() {
                    // Client is gone; the child still dies by the timers.
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::FrameReader;
    use crate::writer::spawn_writer;
    use rstest::rstest;
    use tokio::io::AsyncReadExt;

    fn test_config() -> Config {
        Config::parse(
            r#"
            [system]
            listen-port = 3500
            basedir = "/tmp/a"
            storedir = "/tmp/b"

            [[compilers]]
            name = "gcc"
            language = "C++"
            display-name = "gcc"
            compile-command = ["g++", "prog.cpp"]
            run-command = ["./prog.exe"]
            jail-name = "default"
            switches = ["warning", "optimize", "gnu"]

            [switches.warning]
            flags = ["-Wall"]

            [switches.optimize]
            flags = ["-O2", "-march=native"]
            insert-position = 1

            [switches.gnu]
            flags = ["env", "GNU=1"]
            runtime = true

            [jails.default]
            jail-command = ["jail", "--"]
            compile-time-limit = 60
            program-duration = 10
            "#,
        )
        .unwrap()
    }

    fn steps_for(received: &[(&str, &str)]) -> [CommandStep; 2] {
        let config = test_config();
        let compiler = config.compiler("gcc").unwrap();
        let received: Vec<(String, Vec<u8>)> = received
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        build_steps(compiler, config.jail(compiler), &config.switches, &received)
    }

    // -------------------------------------------------------------------------
    // step construction
    // -------------------------------------------------------------------------

    #[test]
    fn steps_without_options() {
        let [compile, run] = steps_for(&[]);
        assert_eq!(compile.argv, ["jail", "--", "g++", "prog.cpp"]);
        assert_eq!(compile.stdin_field, "");
        assert_eq!(compile.stdout_command, "CompilerMessageS");
        assert_eq!(compile.stderr_command, "CompilerMessageE");
        assert_eq!(compile.soft_kill_wait, 60);

        assert_eq!(run.argv, ["jail", "--", "./prog.exe"]);
        assert_eq!(run.stdin_field, "StdIn");
        assert_eq!(run.stdout_command, "StdOut");
        assert_eq!(run.stderr_command, "StdErr");
        assert_eq!(run.soft_kill_wait, 10);
    }

    #[test]
    fn selected_switch_appends_to_compile_argv() {
        let [compile, run] = steps_for(&[("CompilerOption", "warning")]);
        assert_eq!(compile.argv, ["jail", "--", "g++", "prog.cpp", "-Wall"]);
        assert_eq!(run.argv, ["jail", "--", "./prog.exe"]);
    }

    #[test]
    fn insert_position_splices_mid_argv() {
        let [compile, _] = steps_for(&[("CompilerOption", "optimize")]);
        assert_eq!(
            compile.argv,
            ["jail", "--", "g++", "-O2", "-march=native", "prog.cpp"]
        );
    }

    #[test]
    fn runtime_switch_lands_on_the_run_argv() {
        let [compile, run] = steps_for(&[("CompilerOption", "gnu")]);
        assert_eq!(compile.argv, ["jail", "--", "g++", "prog.cpp"]);
        assert_eq!(run.argv, ["jail", "--", "./prog.exe", "env", "GNU=1"]);
    }

    #[test]
    fn switches_apply_in_allow_list_order() {
        // Client order is irrelevant; the compiler's order wins.
        let [compile, _] = steps_for(&[("CompilerOption", "optimize,warning")]);
        assert_eq!(
            compile.argv,
            ["jail", "--", "g++", "-O2", "-march=native", "prog.cpp", "-Wall"]
        );
    }

    #[test]
    fn unlisted_switch_ids_are_dropped() {
        let [compile, run] = steps_for(&[("CompilerOption", "pedantic,warning,unknown")]);
        assert_eq!(compile.argv, ["jail", "--", "g++", "prog.cpp", "-Wall"]);
        assert_eq!(run.argv, ["jail", "--", "./prog.exe"]);
    }

    #[test]
    fn raw_options_append_per_line() {
        let [compile, run] = steps_for(&[
            ("CompilerOptionRaw", "-DFOO\n-I/inc\n"),
            ("RuntimeOptionRaw", "--fast\r\n--trace\r\n"),
        ]);
        assert_eq!(compile.argv, ["jail", "--", "g++", "prog.cpp", "-DFOO", "-I/inc"]);
        assert_eq!(run.argv, ["jail", "--", "./prog.exe", "--fast", "--trace"]);
    }

    #[rstest]
    #[case("", Vec::new())]
    #[case("-DFOO", vec!["-DFOO"])]
    #[case("-DFOO\n", vec!["-DFOO"])]
    #[case("-a\n-b", vec!["-a", "-b"])]
    #[case("-a\r\n-b\r\n", vec!["-a", "-b"])]
    #[case("-a\n\n-b\n", vec!["-a", "", "-b"])]
    fn raw_option_splitting(#[case] raw: &str, #[case] expected: Vec<&str>) {
        assert_eq!(split_raw_options(raw), expected);
    }

    #[test]
    fn splice_clamps_out_of_range_positions() {
        let mut argv = vec!["a".to_string(), "b".to_string()];
        splice(&mut argv, &["x".to_string()], 99);
        assert_eq!(argv, ["a", "b", "x"]);
    }

    // -------------------------------------------------------------------------
    // supervisor
    // -------------------------------------------------------------------------

    async fn read_frames(mut rx: tokio::io::DuplexStream) -> Vec<(String, Vec<u8>)> {
        let mut bytes = Vec::new();
        rx.read_to_end(&mut bytes).await.unwrap();
        let mut reader = FrameReader::new();
        reader.extend(&bytes);
        let mut frames = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            frames.push((frame.name, frame.payload));
        }
        frames
    }

    fn shell_step(script: &str, soft_kill_wait: u64, is_run: bool) -> CommandStep {
        CommandStep {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            stdin_field: if is_run { "StdIn" } else { "" },
            stdout_command: if is_run { "StdOut" } else { "CompilerMessageS" },
            stderr_command: if is_run { "StdErr" } else { "CompilerMessageE" },
            soft_kill_wait,
        }
    }

    fn plain_jail() -> JailConfig {
        let config = Config::parse(
            r#"
            [system]
            listen-port = 1
            basedir = "/tmp/a"
            storedir = "/tmp/b"

            [jails.default]
            jail-command = []
            kill-wait = 2
            "#,
        )
        .unwrap();
        config.jails["default"].clone()
    }

    #[tokio::test]
    async fn clean_run_emits_start_output_exit_finish() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (sender, writer_task) = spawn_writer(server);

        let steps = [
            shell_step("echo compiled 1>&2", 10, false),
            shell_step("cat", 10, true),
        ];
        let received = vec![("StdIn".to_string(), b"hello\n".to_vec())];
        run_steps(steps, dir.path(), &received, &plain_jail(), &sender)
            .await
            .unwrap();
        drop(sender);
        writer_task.await.unwrap();

        let frames = read_frames(client).await;
        assert_eq!(frames.first().unwrap().0, "Control");
        assert_eq!(frames.first().unwrap().1, b"Start");
        assert!(
            frames
                .iter()
                .any(|(name, payload)| name == "CompilerMessageE" && payload == b"compiled\n")
        );
        assert!(frames.iter().any(|(name, payload)| name == "StdOut" && payload == b"hello\n"));

        let tail: Vec<&str> = frames.iter().rev().take(2).map(|(n, _)| n.as_str()).collect();
        assert_eq!(tail, ["Control", "ExitCode"]);
        let exit = frames.iter().find(|(n, _)| n == "ExitCode").unwrap();
        assert_eq!(exit.1, b"0");
    }

    #[tokio::test]
    async fn failed_compile_skips_the_run_step() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (sender, writer_task) = spawn_writer(server);

        let steps = [
            shell_step("echo nope 1>&2; exit 1", 10, false),
            shell_step("echo never-runs", 10, true),
        ];
        run_steps(steps, dir.path(), &[], &plain_jail(), &sender)
            .await
            .unwrap();
        drop(sender);
        writer_task.await.unwrap();

        let frames = read_frames(client).await;
        let exit = frames.iter().find(|(n, _)| n == "ExitCode").unwrap();
        assert_eq!(exit.1, b"1");
        assert!(!frames.iter().any(|(n, _)| n == "StdOut"));
        assert_eq!(frames.last().unwrap().0, "Control");
        assert_eq!(frames.last().unwrap().1, b"Finish");
    }

    #[tokio::test]
    async fn timed_out_step_reports_a_signal() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (sender, writer_task) = spawn_writer(server);

        let steps = [
            shell_step("exit 0", 10, false),
            shell_step("exec sleep 30", 1, true),
        ];
        run_steps(steps, dir.path(), &[], &plain_jail(), &sender)
            .await
            .unwrap();
        drop(sender);
        writer_task.await.unwrap();

        let frames = read_frames(client).await;
        let signal = frames.iter().find(|(n, _)| n == "Signal").unwrap();
        let name = String::from_utf8_lossy(&signal.1).into_owned();
        assert!(name == "SIGXCPU" || name == "SIGKILL", "got {name}");
        assert_eq!(frames.last().unwrap().0, "Control");
        assert_eq!(frames.last().unwrap().1, b"Finish");
    }

    #[tokio::test]
    async fn spawn_failure_reports_exit_code_127() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (sender, writer_task) = spawn_writer(server);

        let steps = [
            CommandStep {
                argv: vec!["/nonexistent/jail-wrapper".to_string()],
                stdin_field: "",
                stdout_command: "CompilerMessageS",
                stderr_command: "CompilerMessageE",
                soft_kill_wait: 10,
            },
            shell_step("echo never-runs", 10, true),
        ];
        run_steps(steps, dir.path(), &[], &plain_jail(), &sender)
            .await
            .unwrap();
        drop(sender);
        writer_task.await.unwrap();

        let frames = read_frames(client).await;
        let exit = frames.iter().find(|(n, _)| n == "ExitCode").unwrap();
        assert_eq!(exit.1, b"127");
        assert!(!frames.iter().any(|(n, _)| n == "StdOut"));
    }
}
