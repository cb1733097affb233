//! TCP UCI dialog: connects to the chess engine and drives the line-oriented
//! handshake/compute protocol described in the external interfaces.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::EngineError;

const UCIOK_TIMEOUT: Duration = Duration::from_secs(3);
const READYOK_TIMEOUT: Duration = Duration::from_secs(2);
const DEADLINE_PADDING: Duration = Duration::from_millis(5000);

/// The engine's reply to `go movetime N`.
pub struct BestMove {
    pub bestmove: String,
    pub ponder: Option<String>,
    pub info: Option<String>,
}

/// An open dialog with the engine process. Every method takes `&mut self`
/// so the socket can never be driven concurrently from two call sites; the
/// connection is dropped (and thus closed) on every exit path, including
/// early returns on error, because `EngineClient` carries no `Drop` impl
/// beyond the one `TcpStream`'s halves already provide.
pub struct EngineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl EngineClient {
    pub async fn connect(addr: &str) -> Result<Self, EngineError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    async fn send_line(&mut self, line: &str) -> Result<(), EngineError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn await_line_containing(
        &mut self,
        needle: &str,
        label: &'static str,
        deadline: Duration,
    ) -> Result<String, EngineError> {
        let search = async {
            loop {
                let mut line = String::new();
                let bytes_read = self
                    .reader
                    .read_line(&mut line)
                    .await
                    .map_err(EngineError::Connect)?;
                if bytes_read == 0 {
                    return Err(EngineError::Protocol(format!(
                        "engine closed connection while waiting for {label}"
                    )));
                }
                if line.contains(needle) {
                    return Ok(line);
                }
            }
        };

        match tokio::time::timeout(deadline, search).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::DialogTimeout(label)),
        }
    }

    /// `uci` / `uciok`, optional strength limiting, `isready` / `readyok`, `ucinewgame`.
    pub async fn handshake(&mut self, elo: i32) -> Result<(), EngineError> {
        self.send_line("uci").await?;
        self.await_line_containing("uciok", "uciok", UCIOK_TIMEOUT).await?;

        if elo > 0 {
            self.send_line("setoption name UCI_LimitStrength value true").await?;
            self.send_line(&format!("setoption name UCI_Elo value {elo}")).await?;
        }

        self.send_line("isready").await?;
        self.await_line_containing("readyok", "readyok", READYOK_TIMEOUT).await?;

        self.send_line("ucinewgame").await?;
        Ok(())
    }

    /// `position startpos` when `fen` is empty or whitespace, else `position fen {fen}`.
    pub async fn set_position(&mut self, fen: &str) -> Result<(), EngineError> {
        if fen.trim().is_empty() {
            self.send_line("position startpos").await
        } else {
            self.send_line(&format!("position fen {fen}")).await
        }
    }

    /// `go movetime N`, collecting `info ` lines until `bestmove `.
    pub async fn go(&mut self, movetime_ms: i64) -> Result<BestMove, EngineError> {
        let movetime_ms = if movetime_ms <= 0 { 1000 } else { movetime_ms };
        self.send_line(&format!("go movetime {movetime_ms}")).await?;

        let soft_deadline =
            Duration::from_millis(movetime_ms as u64) + DEADLINE_PADDING;

        let mut info_lines = Vec::new();
        let bestmove_line = async {
            loop {
                let mut line = String::new();
                let bytes_read = self
                    .reader
                    .read_line(&mut line)
                    .await
                    .map_err(EngineError::Connect)?;
                if bytes_read == 0 {
                    return Err(EngineError::Protocol(
                        "engine closed connection while computing".to_owned(),
                    ));
                }
                let trimmed = line.trim_end();
                if let Some(rest) = trimmed.strip_prefix("bestmove ") {
                    return Ok(rest.to_owned());
                }
                if let Some(info) = trimmed.strip_prefix("info ") {
                    info_lines.push(info.to_owned());
                }
            }
        };

        let bestmove_line = tokio::time::timeout(soft_deadline, bestmove_line)
            .await
            .map_err(|_| EngineError::DialogTimeout("bestmove"))??;

        parse_bestmove_line(&bestmove_line, info_lines)
    }
}

fn parse_bestmove_line(line: &str, info_lines: Vec<String>) -> Result<BestMove, EngineError> {
    let mut tokens = line.split_whitespace();
    let bestmove = tokens.next().ok_or(EngineError::EmptyBestMove)?;
    if bestmove.is_empty() {
        return Err(EngineError::EmptyBestMove);
    }

    let ponder = match tokens.next() {
        Some("ponder") => tokens.next().map(str::to_owned),
        _ => None,
    };

    let info = if info_lines.is_empty() {
        None
    } else {
        Some(info_lines.join("\n"))
    };

    Ok(BestMove {
        bestmove: bestmove.to_owned(),
        ponder,
        info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bestmove_with_ponder() {
        let result = parse_bestmove_line("e2e4 ponder e7e5", vec!["depth 1 score cp 12".to_owned()])
            .expect("should parse");
        assert_eq!(result.bestmove, "e2e4");
        assert_eq!(result.ponder.as_deref(), Some("e7e5"));
        assert_eq!(result.info.as_deref(), Some("depth 1 score cp 12"));
    }

    #[test]
    fn parses_bestmove_without_ponder() {
        let result = parse_bestmove_line("e2e4", vec![]).expect("should parse");
        assert_eq!(result.bestmove, "e2e4");
        assert!(result.ponder.is_none());
        assert!(result.info.is_none());
    }

    #[test]
    fn empty_bestmove_line_is_an_error() {
        assert!(parse_bestmove_line("", vec![]).is_err());
    }

    /// Binds a stub UCI engine on an ephemeral port and answers exactly the
    /// handshake/position/go dialog `EngineClient` drives, replying `bestmove`
    /// immediately rather than waiting out `movetime_ms`.
    async fn spawn_stub_engine() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = tokio::io::BufReader::new(read_half);
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                let line = line.trim_end();
                if line == "uci" {
                    write_half.write_all(b"uciok\n").await.unwrap();
                } else if line == "isready" {
                    write_half.write_all(b"readyok\n").await.unwrap();
                } else if line.starts_with("go ") {
                    write_half.write_all(b"info depth 1 score cp 20\n").await.unwrap();
                    write_half.write_all(b"bestmove e2e4 ponder e7e5\n").await.unwrap();
                }
                // "setoption", "ucinewgame", and "position" lines get no reply.
            }
        });

        addr
    }

    #[tokio::test]
    async fn full_dialog_against_stub_engine() {
        let addr = spawn_stub_engine().await;
        let mut client = EngineClient::connect(&addr).await.expect("connect");

        client.handshake(1800).await.expect("handshake");
        client.set_position("startpos").await.expect("set_position");
        let bestmove = client.go(10).await.expect("go");

        assert_eq!(bestmove.bestmove, "e2e4");
        assert_eq!(bestmove.ponder.as_deref(), Some("e7e5"));
        assert_eq!(bestmove.info.as_deref(), Some("depth 1 score cp 20"));
    }
}
