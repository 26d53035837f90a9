//! Mock SMTP server for exercising delivery scenarios.
//!
//! Supports scripted failures: refusing the first N connections, rejecting
//! MAIL FROM with a fixed code, and dropping the connection instead of
//! answering the end-of-data, plus command recording for assertions.
#![allow(dead_code)] // Test utility module - not every knob is used in every test

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
struct MockConfig {
    reject_first_connections: usize,
    advertise_auth: bool,
    mail_from_response: (u16, String),
    rcpt_to_response: (u16, String),
    data_end_response: (u16, String),
    drop_on_data_end: usize,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            reject_first_connections: 0,
            advertise_auth: false,
            mail_from_response: (250, "OK".to_string()),
            rcpt_to_response: (250, "OK".to_string()),
            data_end_response: (250, "queued".to_string()),
            drop_on_data_end: 0,
        }
    }
}

#[derive(Default)]
struct MockState {
    connections: AtomicUsize,
    transactions: AtomicUsize,
    data_drops_left: AtomicUsize,
    commands: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    connection_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for a [`MockSmtpServer`].
#[derive(Default)]
pub struct MockSmtpServerBuilder {
    config: MockConfig,
}

impl MockSmtpServerBuilder {
    /// Close the first `n` connections without even greeting.
    pub fn reject_first_connections(mut self, n: usize) -> Self {
        self.config.reject_first_connections = n;
        self
    }

    pub fn advertise_auth(mut self) -> Self {
        self.config.advertise_auth = true;
        self
    }

    pub fn mail_from_response(mut self, code: u16, message: &str) -> Self {
        self.config.mail_from_response = (code, message.to_string());
        self
    }

    pub fn rcpt_to_response(mut self, code: u16, message: &str) -> Self {
        self.config.rcpt_to_response = (code, message.to_string());
        self
    }

    pub fn data_end_response(mut self, code: u16, message: &str) -> Self {
        self.config.data_end_response = (code, message.to_string());
        self
    }

    /// Drop the connection instead of answering the first `n` end-of-data
    /// markers.
    pub fn drop_on_data_end(mut self, n: usize) -> Self {
        self.config.drop_on_data_end = n;
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState::default());
        state
            .data_drops_left
            .store(self.config.drop_on_data_end, Ordering::SeqCst);

        let config = self.config;
        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let index = accept_state.connections.fetch_add(1, Ordering::SeqCst);
                if index < config.reject_first_connections {
                    drop(stream);
                    continue;
                }
                let config = config.clone();
                let state = accept_state.clone();
                let task_state = state.clone();
                let task = tokio::spawn(async move {
                    let _ = serve(stream, config, state).await;
                });
                task_state.connection_tasks.lock().unwrap().push(task);
            }
        });

        Ok(MockSmtpServer {
            addr,
            state,
            handle,
        })
    }
}

/// A scripted SMTP server on an ephemeral local port.
pub struct MockSmtpServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockSmtpServer {
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::default()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far, including rejected ones.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// MAIL FROM commands seen.
    pub fn transactions(&self) -> usize {
        self.state.transactions.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Complete DATA payloads received.
    pub fn messages(&self) -> Vec<String> {
        self.state.messages.lock().unwrap().clone()
    }

    /// Stop accepting and sever every live connection.
    pub fn shutdown(&self) {
        self.handle.abort();
        for task in self.state.connection_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    stream: TcpStream,
    config: MockConfig,
    state: Arc<MockState>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half.write_all(b"220 mock ESMTP ready\r\n").await?;

    while let Some(line) = lines.next_line().await? {
        state.commands.lock().unwrap().push(line.clone());
        let upper = line.to_ascii_uppercase();

        if upper.starts_with("EHLO") {
            let mut reply = String::from("250-mock\r\n250-SIZE 10485760\r\n250-DSN\r\n");
            if config.advertise_auth {
                reply.push_str("250-AUTH PLAIN LOGIN\r\n");
            }
            reply.push_str("250 HELP\r\n");
            write_half.write_all(reply.as_bytes()).await?;
        } else if upper.starts_with("HELO") {
            write_half.write_all(b"250 mock\r\n").await?;
        } else if upper.starts_with("AUTH") {
            write_half.write_all(b"235 2.7.0 accepted\r\n").await?;
        } else if upper.starts_with("MAIL FROM") {
            state.transactions.fetch_add(1, Ordering::SeqCst);
            let (code, message) = &config.mail_from_response;
            write_half
                .write_all(format!("{code} {message}\r\n").as_bytes())
                .await?;
        } else if upper.starts_with("RCPT TO") {
            let (code, message) = &config.rcpt_to_response;
            write_half
                .write_all(format!("{code} {message}\r\n").as_bytes())
                .await?;
        } else if upper == "DATA" {
            write_half.write_all(b"354 go ahead\r\n").await?;
            let mut body = String::new();
            while let Some(data_line) = lines.next_line().await? {
                if data_line == "." {
                    break;
                }
                body.push_str(&data_line);
                body.push_str("\r\n");
            }
            state.messages.lock().unwrap().push(body);

            let drops = &state.data_drops_left;
            if drops
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                // Simulate the relay dying right before the final reply.
                return Ok(());
            }
            let (code, message) = &config.data_end_response;
            write_half
                .write_all(format!("{code} {message}\r\n").as_bytes())
                .await?;
        } else if upper == "NOOP" || upper == "RSET" {
            write_half.write_all(b"250 OK\r\n").await?;
        } else if upper == "QUIT" {
            write_half.write_all(b"221 bye\r\n").await?;
            break;
        } else {
            write_half.write_all(b"500 unrecognized\r\n").await?;
        }
    }

    Ok(())
}
