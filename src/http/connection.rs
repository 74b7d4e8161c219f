use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::http::parser::{expects_continue, parse_http_request, ParseError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::proxy::{Outcome, ProxyHandler};

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
    state: ConnectionState,
    handler: ProxyHandler,
    continue_sent: bool,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

enum ReadOutcome {
    Request(Request),
    Malformed(ParseError),
    Closed,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, handler: ProxyHandler) -> Self {
        Self {
            stream,
            peer,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            handler,
            continue_sent: false,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await? {
                        ReadOutcome::Request(req) => ConnectionState::Processing(req),
                        ReadOutcome::Malformed(e) => {
                            warn!(peer = %self.peer, error = ?e, "malformed request");
                            let writer = ResponseWriter::new(&parse_error_response(e), false);
                            ConnectionState::Writing(writer, false)
                        }
                        ReadOutcome::Closed => ConnectionState::Closed,
                    };
                }

                ConnectionState::Processing(req) => {
                    let keep_alive = req.keep_alive();
                    let pending = std::mem::take(&mut self.buffer);

                    let outcome = self
                        .handler
                        .handle(&mut self.stream, &pending, req, self.peer.ip())
                        .await?;

                    match outcome {
                        Outcome::Respond(response) => {
                            self.buffer = pending;
                            let writer = ResponseWriter::new(&response, keep_alive);
                            self.state = ConnectionState::Writing(writer, keep_alive);
                        }
                        // The exchange ran to completion on this socket.
                        Outcome::Proxied => self.state = ConnectionState::Closed,
                    }
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn read_request(&mut self) -> anyhow::Result<ReadOutcome> {
        loop {
            // Try parsing whatever we already have
            match parse_http_request(&self.buffer) {
                Ok((request, consumed)) => {
                    self.buffer.drain(..consumed);
                    self.continue_sent = false;
                    return Ok(ReadOutcome::Request(request));
                }

                Err(ParseError::Incomplete) => {
                    // Head is in, body withheld until we say go
                    if !self.continue_sent && expects_continue(&self.buffer) {
                        self.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
                        self.continue_sent = true;
                    }
                }

                Err(e) => return Ok(ReadOutcome::Malformed(e)),
            }

            let mut temp = [0u8; 8192];
            let n = match timeout(self.handler.idle_timeout(), self.stream.read(&mut temp)).await {
                Ok(read) => read?,
                Err(_) => {
                    debug!(peer = %self.peer, "client idle, closing connection");
                    return Ok(ReadOutcome::Closed);
                }
            };

            if n == 0 {
                // Client closed connection
                return Ok(ReadOutcome::Closed);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }
}

fn parse_error_response(error: ParseError) -> Response {
    match error {
        ParseError::HeadersTooLarge => Response::headers_too_large(),
        ParseError::BodyTooLarge => Response::payload_too_large(),
        _ => Response::bad_request(),
    }
}
