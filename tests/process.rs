use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use pumpkin::{async_exec, sync_exec, Classification, Command, ProcessState, Reactor, Stdio, Stream, Subprocess};

fn init() {
    let _ = pretty_env_logger::try_init();
}

fn sh(script: &str) -> Command {
    Command::new("/bin/sh").args(&["-c", script])
}

fn collect(cmd: &Command) -> (Classification, Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let res = sync_exec(cmd, |stream, bytes| match stream {
        Stream::Stdout => stdout.extend_from_slice(bytes),
        Stream::Stderr => stderr.extend_from_slice(bytes),
        Stream::Stdin => unreachable!(),
    })
    .unwrap();
    (res, stdout, stderr)
}

#[test]
fn exit_code() {
    init();
    let (res, _, _) = collect(&sh("exit 7"));
    assert_eq!(res, Classification::Exited(7));
}

#[test]
fn deadline_kills_and_reaps() {
    init();
    let cmd = sh("echo $$; exec sleep 5")
        .stdout(Stdio::Piped)
        .deadline(Duration::from_millis(100));
    let mut process = Subprocess::new(cmd);

    let start = Instant::now();
    let mut out = Vec::new();
    let res = process.sync_exec(|_, bytes| out.extend_from_slice(bytes)).unwrap();

    assert_eq!(res, Classification::TimedOutAndKilled);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(process.state(), ProcessState::Completed(Classification::TimedOutAndKilled));

    // Already reaped: the pid is no longer our child.
    let pid: libc::pid_t = String::from_utf8(out).unwrap().trim().parse().unwrap();
    let res = unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
    assert_eq!(res, -1);
    assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::ECHILD));
}

#[test]
fn fast_child_within_deadline() {
    init();
    let (res, _, _) = collect(&sh("exit 0").deadline(Duration::from_secs(10)));
    assert!(res.success());
}

#[test]
fn piped_output() {
    init();
    let cmd = sh("echo hello; echo oops >&2").stdout(Stdio::Piped).stderr(Stdio::Piped);
    let (res, out, err) = collect(&cmd);
    assert_eq!(res, Classification::Exited(0));
    assert_eq!(out, b"hello\n");
    assert_eq!(err, b"oops\n");
}

#[test]
fn stdin_input_is_fed_and_closed() {
    init();
    let input = "line\n".repeat(20_000);
    let cmd = Command::new("cat")
        .stdin(Stdio::Piped)
        .stdout(Stdio::Piped)
        .input(input.clone());

    let (res, out, _) = collect(&cmd);
    assert_eq!(res, Classification::Exited(0));
    assert_eq!(out, input.as_bytes());
}

#[test]
fn stderr_joins_stdout() {
    init();
    let cmd = sh("echo a; echo b >&2").stdout(Stdio::Piped).stderr(Stdio::JoinStdout);
    let (_, out, err) = collect(&cmd);
    assert_eq!(out, b"a\nb\n");
    assert!(err.is_empty());
}

#[test]
fn null_stdio() {
    init();
    let cmd = sh("read line; echo \"[$line]\"").stdin(Stdio::Null).stdout(Stdio::Piped);
    let (res, out, _) = collect(&cmd);
    // `read` hits end of input straight away.
    assert_eq!(res, Classification::Exited(1));
    assert_eq!(out, b"");
}

#[test]
fn environment_overrides() {
    init();
    let cmd = sh("echo \"$PUMPKIN_A-$PUMPKIN_B\"")
        .env("PUMPKIN_A", "one")
        .env("PUMPKIN_B", "two")
        .env("PUMPKIN_A", "three")
        .stdout(Stdio::Piped);
    let (_, out, _) = collect(&cmd);
    assert_eq!(out, b"three-two\n");
}

#[test]
fn exec_failure_exits_127() {
    init();
    let (res, _, _) = collect(&Command::new("/no/such/program"));
    assert_eq!(res, Classification::Exited(127));
}

#[test]
fn many_children_on_one_reactor() {
    init();
    let mut reactor = Reactor::new().unwrap();
    let done = Rc::new(RefCell::new(Vec::new()));
    let output = Rc::new(RefCell::new(Vec::new()));

    let mut handles = Vec::new();
    for n in 0..5 {
        let cmd = sh(&format!("sleep 0.0{}; echo {}; exit {}", n, n, n)).stdout(Stdio::Piped);
        let (d, o) = (done.clone(), output.clone());
        let handle = async_exec(
            &mut reactor,
            &cmd,
            move |_, bytes| o.borrow_mut().extend_from_slice(bytes),
            move |_, classification| d.borrow_mut().push((n, classification)),
        )
        .unwrap();
        handles.push(handle);
    }

    let slow = sh("sleep 5").deadline(Duration::from_millis(100));
    let d = done.clone();
    async_exec(&mut reactor, &slow, |_, _| {}, move |_, classification| d.borrow_mut().push((99, classification)))
        .unwrap();

    let start = Instant::now();
    reactor.run(Some(Duration::from_secs(5))).unwrap();
    assert!(start.elapsed() < Duration::from_secs(3));

    let mut done = done.borrow().clone();
    done.sort_by_key(|(n, _)| *n);
    let expected: Vec<(i32, Classification)> = (0..5)
        .map(|n| (n, Classification::Exited(n)))
        .chain(std::iter::once((99, Classification::TimedOutAndKilled)))
        .collect();
    assert_eq!(done, expected);

    let mut out = output.borrow().clone();
    out.sort();
    assert_eq!(out, b"\n\n\n\n\n01234");

    for handle in handles {
        assert!(!handle.is_running());
    }
    assert!(reactor.is_empty());
}

#[test]
fn completion_can_start_the_next_child() {
    init();
    let mut reactor = Reactor::new().unwrap();
    let done = Rc::new(RefCell::new(Vec::new()));

    let d = done.clone();
    async_exec(&mut reactor, &sh("exit 1"), |_, _| {}, move |reactor, first| {
        d.borrow_mut().push(first);
        let d = d.clone();
        async_exec(reactor, &sh("exit 2"), |_, _| {}, move |_, second| d.borrow_mut().push(second)).unwrap();
    })
    .unwrap();

    reactor.run(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(*done.borrow(), vec![Classification::Exited(1), Classification::Exited(2)]);
}
