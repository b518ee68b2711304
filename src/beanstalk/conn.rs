//! A single beanstalkd connection speaking the text protocol.
//!
//! Commands are CRLF-terminated lines; data-bearing replies (`RESERVED`, `OK`)
//! are followed by a length-prefixed body and a trailing CRLF. Stats and tube
//! listings arrive as a restricted YAML subset (one `key: value` or `- item`
//! per line) which is parsed directly rather than through a YAML crate.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{BeanstalkError, Job, JobStats, Result};

/// Outcome of a reserve-with-timeout call.
///
/// A timeout is the cooperative yield point of the broker loop, not a
/// failure, so it is distinguished from [`BeanstalkError`] at the type level.
#[derive(Debug)]
pub enum Reserve {
    /// A job was reserved.
    Job(Job),

    /// The timeout elapsed with no job available. `DEADLINE_SOON` is folded
    /// in here as well: both mean "yield now, try again".
    TimedOut,
}

/// One TCP connection to a beanstalkd server.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    /// Connects to a beanstalkd server at `address` (`host:port`).
    pub async fn dial(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (read, write) = stream.into_split();
        Ok(Connection {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    /// Adds `tube` to this connection's watch set.
    pub async fn watch(&mut self, tube: &str) -> Result<()> {
        self.send(&format!("watch {tube}")).await?;
        let reply = self.read_line().await?;
        if reply.starts_with("WATCHING ") {
            Ok(())
        } else {
            Err(reply_error(reply))
        }
    }

    /// Removes `tube` from this connection's watch set.
    pub async fn ignore(&mut self, tube: &str) -> Result<()> {
        self.send(&format!("ignore {tube}")).await?;
        let reply = self.read_line().await?;
        if reply.starts_with("WATCHING ") {
            Ok(())
        } else {
            Err(reply_error(reply))
        }
    }

    /// Reduces the watch set to exactly `tube`.
    ///
    /// New connections watch `default`; watching the target tube first keeps
    /// the set non-empty, then `default` is dropped unless it is the target.
    pub async fn watch_only(&mut self, tube: &str) -> Result<()> {
        self.watch(tube).await?;
        if tube != "default" {
            self.ignore("default").await?;
        }
        Ok(())
    }

    /// Reserves a job from the watched tubes, waiting at most `timeout`.
    pub async fn reserve_with_timeout(&mut self, timeout: Duration) -> Result<Reserve> {
        self.send(&format!("reserve-with-timeout {}", timeout.as_secs()))
            .await?;
        let reply = self.read_line().await?;
        let mut words = reply.split_whitespace();
        match words.next() {
            Some("RESERVED") => {
                let id = parse_field::<u64>(words.next(), &reply)?;
                let len = parse_field::<usize>(words.next(), &reply)?;
                let body = self.read_data(len).await?;
                Ok(Reserve::Job(Job { id, body }))
            }
            Some("TIMED_OUT") | Some("DEADLINE_SOON") => Ok(Reserve::TimedOut),
            _ => Err(reply_error(reply)),
        }
    }

    /// Deletes a job this connection has reserved.
    pub async fn delete(&mut self, id: u64) -> Result<()> {
        self.simple(&format!("delete {id}"), "DELETED").await
    }

    /// Releases a reserved job back to the ready queue after `delay`.
    pub async fn release(&mut self, id: u64, priority: u32, delay: Duration) -> Result<()> {
        self.simple(
            &format!("release {id} {priority} {}", delay.as_secs()),
            "RELEASED",
        )
        .await
    }

    /// Buries a reserved job: removes it from normal rotation until an
    /// operator kicks it.
    pub async fn bury(&mut self, id: u64, priority: u32) -> Result<()> {
        self.simple(&format!("bury {id} {priority}"), "BURIED").await
    }

    /// Refreshes the reservation's TTR countdown.
    pub async fn touch(&mut self, id: u64) -> Result<()> {
        self.simple(&format!("touch {id}"), "TOUCHED").await
    }

    /// Fetches the per-job counters the broker's policy checks read.
    pub async fn stats_job(&mut self, id: u64) -> Result<JobStats> {
        self.send(&format!("stats-job {id}")).await?;
        let body = self.read_ok_body().await?;
        parse_job_stats(&body)
    }

    /// Number of times the job has timed out of a reservation.
    pub async fn timeouts(&mut self, id: u64) -> Result<u64> {
        Ok(self.stats_job(id).await?.timeouts)
    }

    /// Number of times the job has been released.
    pub async fn releases(&mut self, id: u64) -> Result<u64> {
        Ok(self.stats_job(id).await?.releases)
    }

    /// Time until the current reservation's TTR expires.
    pub async fn time_left(&mut self, id: u64) -> Result<Duration> {
        Ok(self.stats_job(id).await?.time_left)
    }

    /// Lists all tubes currently existing on the server.
    pub async fn list_tubes(&mut self) -> Result<Vec<String>> {
        self.send("list-tubes").await?;
        let body = self.read_ok_body().await?;
        Ok(parse_tube_list(&body))
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        let mut line = Vec::with_capacity(command.len() + 2);
        line.extend_from_slice(command.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.writer.write_all(&line).await?;
        Ok(())
    }

    /// Sends a command whose success reply is a single bare word.
    async fn simple(&mut self, command: &str, expect: &str) -> Result<()> {
        self.send(command).await?;
        let reply = self.read_line().await?;
        if reply == expect {
            Ok(())
        } else {
            Err(reply_error(reply))
        }
    }

    /// Reads one reply line, without the trailing CRLF.
    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(BeanstalkError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Reads a `len`-byte data section plus its trailing CRLF.
    async fn read_data(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len + 2];
        self.reader.read_exact(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Reads an `OK <bytes>` reply and returns its data section as text.
    async fn read_ok_body(&mut self) -> Result<String> {
        let reply = self.read_line().await?;
        let mut words = reply.split_whitespace();
        match words.next() {
            Some("OK") => {
                let len = parse_field::<usize>(words.next(), &reply)?;
                let body = self.read_data(len).await?;
                String::from_utf8(body)
                    .map_err(|_| BeanstalkError::Malformed("non-utf8 stats body".into()))
            }
            _ => Err(reply_error(reply)),
        }
    }
}

/// Maps a non-success reply line onto an error.
fn reply_error(reply: String) -> BeanstalkError {
    match reply.as_str() {
        "NOT_FOUND" => BeanstalkError::NotFound,
        "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND" | "DRAINING" => {
            BeanstalkError::Server(reply)
        }
        _ => BeanstalkError::UnexpectedReply(reply),
    }
}

fn parse_field<T: std::str::FromStr>(word: Option<&str>, reply: &str) -> Result<T> {
    word.and_then(|w| w.parse().ok())
        .ok_or_else(|| BeanstalkError::Malformed(format!("bad reply line: {reply:?}")))
}

/// Parses the `stats-job` YAML dict. Unknown keys are ignored; the three
/// counters the broker needs must parse as integers when present.
fn parse_job_stats(body: &str) -> Result<JobStats> {
    let mut stats = JobStats::default();
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "timeouts" => stats.timeouts = parse_stat(value, "timeouts")?,
            "releases" => stats.releases = parse_stat(value, "releases")?,
            "time-left" => stats.time_left = Duration::from_secs(parse_stat(value, "time-left")?),
            _ => {}
        }
    }
    Ok(stats)
}

fn parse_stat(value: &str, key: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| BeanstalkError::Malformed(format!("bad {key} value: {value:?}")))
}

/// Parses the `list-tubes` YAML list.
fn parse_tube_list(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("- "))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
