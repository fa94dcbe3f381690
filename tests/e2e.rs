use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat_relay");

    let (mut server_child, mut server_stdout) = spawn_server(&binary).await?;
    let port = read_server_port(&mut server_stdout).await?;

    // Drain further server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let mut alice = spawn_client(&binary, "alice", &port).await?;

    // Alice's echo proves her login was accepted and routing works.
    alice.send_line("ping").await.context("alice send ping")?;
    let alice_echo = read_line_expect(&mut alice.stdout, "waiting for alice echo").await?;
    assert_eq!(alice_echo, "alice> ping");

    let mut bob = spawn_client(&binary, "bob", &port).await?;

    // Bob speaks; his own echo and Alice's copy prove both are subscribed.
    bob.send_line("hi all").await.context("bob send line")?;
    let bob_echo = read_line_expect(&mut bob.stdout, "waiting for bob echo").await?;
    assert_eq!(bob_echo, "bob> hi all");
    let alice_hears_bob =
        read_line_expect(&mut alice.stdout, "waiting for alice to hear bob").await?;
    assert_eq!(alice_hears_bob, "bob> hi all");

    // Alice greets; the broadcast is delivered to both participants.
    alice
        .send_line("Hello from Alice")
        .await
        .context("alice send greeting")?;
    let bob_hears_alice =
        read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "alice> Hello from Alice");
    let alice_self = read_line_expect(&mut alice.stdout, "waiting for alice self-echo").await?;
    assert_eq!(alice_self, "alice> Hello from Alice");

    // Query commands report the live connection parameters.
    alice.send_line("#getport").await.context("alice getport")?;
    let port_line = read_line_expect(&mut alice.stdout, "waiting for getport reply").await?;
    assert_eq!(port_line, format!("*** Current port: {port}"));
    alice.send_line("#gethost").await.context("alice gethost")?;
    let host_line = read_line_expect(&mut alice.stdout, "waiting for gethost reply").await?;
    assert_eq!(host_line, "*** Current host: 127.0.0.1");

    // Alice quits; her console confirms the close and the process exits.
    alice.send_line("#quit").await.context("alice send quit")?;
    let alice_closed = read_line_expect(&mut alice.stdout, "waiting for alice close notice").await?;
    assert_eq!(alice_closed, "*** Your connection has closed.");
    ensure_success(&mut alice.child, "alice client").await?;

    // Bob logs off first, then quits from the disconnected state.
    bob.send_line("#logoff").await.context("bob send logoff")?;
    let bob_closed = read_line_expect(&mut bob.stdout, "waiting for bob close notice").await?;
    assert_eq!(bob_closed, "*** Your connection has closed.");
    bob.send_line("#quit").await.context("bob send quit")?;
    ensure_success(&mut bob.child, "bob client").await?;

    // The server stays up after clients leave; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("0")
        .env("RUST_LOG", "info")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

/// Parses the bound port out of the server's listening banner.
async fn read_server_port(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("server did not emit a listening banner")?;
    let token = line
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    // Strip any terminal styling around the number.
    let port: String = token.chars().filter(char::is_ascii_digit).collect();
    if port.is_empty() {
        return Err(anyhow!("server banner missing port: {line}"));
    }
    Ok(port)
}

async fn spawn_client(binary: &Path, identity: &str, port: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--identity")
        .arg(identity)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port)
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {identity}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let banner = read_line_expect(&mut process.stdout, "waiting for logon banner").await?;
    if banner != format!("*** {identity} has logged on.") {
        return Err(anyhow!("expected logon banner for {identity}, got '{banner}'"));
    }

    Ok(process)
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
