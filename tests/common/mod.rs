//! Shared helpers for the end-to-end tests: a server on an ephemeral port, a
//! tokio-postgres client, and a raw wire client for message-level checks.

#![allow(dead_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pgbridge::{config::Config, engine::Engine, server::Server};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_postgres::{Client, NoTls};

/// Starts a server for `config` on `127.0.0.1:0` and returns its address.
pub async fn start(config: Config) -> SocketAddr {
    let config = Config {
        listen: "127.0.0.1:0".to_string(),
        ..config
    };
    let engine = Arc::new(Engine::open(config).await.unwrap());
    let server = Server::bind(engine).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

pub async fn start_in_memory() -> SocketAddr {
    start(Config::in_memory()).await
}

pub async fn start_on_file(path: &Path) -> SocketAddr {
    start(Config {
        database: path.to_path_buf(),
        ..Config::default()
    })
    .await
}

pub async fn connect(addr: SocketAddr) -> Client {
    let (client, connection) = tokio_postgres::connect(
        &format!("host={} port={} user=app dbname=app", addr.ip(), addr.port()),
        NoTls,
    )
    .await
    .unwrap();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// A backend message: tag and body.
pub type Message = (u8, Bytes);

/// Minimal frontend that speaks the wire protocol directly.
pub struct WireClient {
    stream: TcpStream,
}

impl WireClient {
    /// Connects and completes the startup handshake.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Self { stream };
        client.startup().await;
        client
    }

    /// Sends an SSLRequest first and returns the one-byte answer along with
    /// the client, which then completes a plain startup.
    pub async fn connect_with_ssl_request(addr: SocketAddr) -> (u8, Self) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut request = BytesMut::new();
        request.put_i32(8);
        request.put_i32(80_877_103);
        stream.write_all(&request).await.unwrap();
        let answer = stream.read_u8().await.unwrap();
        let mut client = Self { stream };
        client.startup().await;
        (answer, client)
    }

    async fn startup(&mut self) {
        let mut body = BytesMut::new();
        body.put_i32(196_608);
        for (key, value) in [("user", "app"), ("database", "app")] {
            put_cstring(&mut body, key);
            put_cstring(&mut body, value);
        }
        body.put_u8(0);
        let mut message = BytesMut::new();
        message.put_i32(body.len() as i32 + 4);
        message.extend_from_slice(&body);
        self.stream.write_all(&message).await.unwrap();

        let messages = self.until_ready().await;
        assert_eq!(messages.first().map(|m| m.0), Some(b'R'));
    }

    pub async fn send(&mut self, tag: u8, body: BytesMut) {
        let mut message = BytesMut::with_capacity(body.len() + 5);
        message.put_u8(tag);
        message.put_i32(body.len() as i32 + 4);
        message.extend_from_slice(&body);
        self.stream.write_all(&message).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        let tag = self.stream.read_u8().await.unwrap();
        let len = self.stream.read_i32().await.unwrap() as usize;
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        (tag, Bytes::from(body))
    }

    /// Reads messages up to and including ReadyForQuery.
    pub async fn until_ready(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        loop {
            let message = self.recv().await;
            let done = message.0 == b'Z';
            messages.push(message);
            if done {
                return messages;
            }
        }
    }

    pub async fn query(&mut self, sql: &str) -> Vec<Message> {
        let mut body = BytesMut::new();
        put_cstring(&mut body, sql);
        self.send(b'Q', body).await;
        self.until_ready().await
    }

    pub async fn parse(&mut self, name: &str, sql: &str, param_types: &[u32]) {
        let mut body = BytesMut::new();
        put_cstring(&mut body, name);
        put_cstring(&mut body, sql);
        body.put_i16(param_types.len() as i16);
        for oid in param_types {
            body.put_u32(*oid);
        }
        self.send(b'P', body).await;
    }

    /// Bind with every parameter in text format and text results.
    pub async fn bind(&mut self, portal: &str, statement: &str, params: &[Option<&str>]) {
        let mut body = BytesMut::new();
        put_cstring(&mut body, portal);
        put_cstring(&mut body, statement);
        body.put_i16(0);
        body.put_i16(params.len() as i16);
        for param in params {
            match param {
                Some(value) => {
                    body.put_i32(value.len() as i32);
                    body.put_slice(value.as_bytes());
                }
                None => body.put_i32(-1),
            }
        }
        body.put_i16(0);
        self.send(b'B', body).await;
    }

    pub async fn describe(&mut self, target: u8, name: &str) {
        let mut body = BytesMut::new();
        body.put_u8(target);
        put_cstring(&mut body, name);
        self.send(b'D', body).await;
    }

    pub async fn execute(&mut self, portal: &str, max_rows: i32) {
        let mut body = BytesMut::new();
        put_cstring(&mut body, portal);
        body.put_i32(max_rows);
        self.send(b'E', body).await;
    }

    pub async fn sync(&mut self) -> Vec<Message> {
        self.send(b'S', BytesMut::new()).await;
        self.until_ready().await
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_cstring(body: &mut Bytes) -> String {
    let end = body.iter().position(|b| *b == 0).unwrap();
    let s = String::from_utf8(body[..end].to_vec()).unwrap();
    body.advance(end + 1);
    s
}

pub fn tags(messages: &[Message]) -> String {
    messages.iter().map(|(tag, _)| *tag as char).collect()
}

/// A RowDescription field.
#[derive(Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub table_oid: u32,
    pub attnum: i16,
    pub type_oid: u32,
    pub typmod: i32,
}

pub fn row_description(messages: &[Message]) -> Vec<FieldInfo> {
    let (_, body) = messages.iter().find(|(tag, _)| *tag == b'T').unwrap();
    let mut body = body.clone();
    let count = body.get_i16();
    (0..count)
        .map(|_| {
            let name = get_cstring(&mut body);
            let table_oid = body.get_u32();
            let attnum = body.get_i16();
            let type_oid = body.get_u32();
            body.get_i16(); // typlen
            let typmod = body.get_i32();
            body.get_i16(); // format
            FieldInfo {
                name,
                table_oid,
                attnum,
                type_oid,
                typmod,
            }
        })
        .collect()
}

/// Text values of every DataRow in `messages`.
pub fn data_rows(messages: &[Message]) -> Vec<Vec<Option<String>>> {
    messages
        .iter()
        .filter(|(tag, _)| *tag == b'D')
        .map(|(_, body)| {
            let mut body = body.clone();
            let count = body.get_i16();
            (0..count)
                .map(|_| {
                    let len = body.get_i32();
                    if len < 0 {
                        return None;
                    }
                    let value = body.split_to(len as usize);
                    Some(String::from_utf8(value.to_vec()).unwrap())
                })
                .collect()
        })
        .collect()
}

/// SQLSTATE of the first ErrorResponse in `messages`.
pub fn error_code(messages: &[Message]) -> Option<String> {
    let (_, body) = messages.iter().find(|(tag, _)| *tag == b'E')?;
    let mut body = body.clone();
    while body.has_remaining() {
        let field = body.get_u8();
        if field == 0 {
            break;
        }
        let value = get_cstring(&mut body);
        if field == b'C' {
            return Some(value);
        }
    }
    None
}

pub fn command_tags(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|(tag, _)| *tag == b'C')
        .map(|(_, body)| {
            let mut body = body.clone();
            get_cstring(&mut body)
        })
        .collect()
}
