//! Ingest writers: three TCP listener modalities sharing one active-segment
//! state machine, differing only in per-record handshake and durability
//! timing (spec §4.4).

use std::sync::Arc;
use std::time::{Duration, Instant};

use ledgerd_core::{split_records, Ulid};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::ingest::IngestLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Fast,
    Durable,
    Bulk,
}

impl Modality {
    fn label(&self) -> &'static str {
        match self {
            Modality::Fast => "fast",
            Modality::Durable => "durable",
            Modality::Bulk => "bulk",
        }
    }
}

/// One TCP listener for one modality. Spawns a dedicated actor per
/// accepted connection (spec §5 "Scheduling model").
pub struct WriterListener {
    addr: String,
    modality: Modality,
    ingest: Arc<IngestLog>,
    flush_size: u64,
    flush_age: Duration,
}

impl WriterListener {
    pub fn new(addr: String, modality: Modality, ingest: Arc<IngestLog>, flush_size: u64, flush_age: Duration) -> Self {
        WriterListener {
            addr,
            modality,
            ingest,
            flush_size,
            flush_age,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener, cancel).await
    }

    async fn serve(self: Arc<Self>, listener: TcpListener, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        log::info!("{} writer listening on {}", self.modality.label(), self.addr);
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    log::info!("{} writer on {} stopping", self.modality.label(), self.addr);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer_addr) = accepted?;
                    let this = self.clone();
                    let conn_cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(socket, conn_cancel).await {
                            log::warn!("{} connection from {} failed: {}", this.modality.label(), peer_addr, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, socket: tokio::net::TcpStream, cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        match self.modality {
            Modality::Fast => self.handle_streaming(socket, cancel, false).await,
            Modality::Durable => self.handle_streaming(socket, cancel, true).await,
            Modality::Bulk => self.handle_bulk(socket).await,
        }
    }

    /// Fast/Durable: Idle -> Writing -> Rotation, driven by incoming lines
    /// plus a concurrent age timer.
    async fn handle_streaming(&self, socket: tokio::net::TcpStream, mut cancel: watch::Receiver<bool>, durable: bool) -> anyhow::Result<()> {
        let (read_half, mut write_half) = tokio::io::split(socket);
        let mut reader = BufReader::new(read_half);
        let writer_id = Ulid::new().to_string();
        let mut active: Option<crate::ingest::ActiveSegment> = None;
        let mut rotate_at: Option<Instant> = None;
        let mut line = String::new();

        loop {
            let age_wait = async {
                match rotate_at {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.changed() => {
                    if let Some(seg) = active.take() {
                        seg.close("close").await?;
                    }
                    return Ok(());
                }
                _ = age_wait => {
                    if let Some(seg) = active.take() {
                        seg.close("age").await?;
                    }
                    rotate_at = None;
                }
                read_result = reader.read_line(&mut line) => {
                    let n = read_result?;
                    if n == 0 {
                        if let Some(seg) = active.take() {
                            seg.close("close").await?;
                        }
                        return Ok(());
                    }
                    let record = line.trim_end_matches(['\n', '\r']).to_string();
                    line.clear();

                    if active.is_none() {
                        let seg = self.ingest.create(&writer_id).await?;
                        rotate_at = Some(Instant::now() + self.flush_age);
                        active = Some(seg);
                    }

                    let write_result = active.as_mut().unwrap().write_record(record.as_bytes()).await;
                    if let Err(e) = write_result {
                        if durable {
                            write_half.write_all(format!("ERR {e}\n").as_bytes()).await?;
                        }
                        if let Some(seg) = active.take() {
                            let _ = seg.close("close").await;
                        }
                        return Err(e.into());
                    }

                    if durable {
                        if let Err(e) = active.as_mut().unwrap().sync().await {
                            write_half.write_all(format!("ERR {e}\n").as_bytes()).await?;
                        } else {
                            write_half.write_all(b"OK\n").await?;
                        }
                    }

                    if active.as_ref().unwrap().bytes_written() >= self.flush_size {
                        if let Some(seg) = active.take() {
                            seg.close("size").await?;
                        }
                        rotate_at = None;
                    }
                }
            }
        }
    }

    /// Bulk: one pre-formed segment, validated, flushed, and acknowledged
    /// once.
    async fn handle_bulk(&self, socket: tokio::net::TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = tokio::io::split(socket);
        let mut reader = BufReader::new(read_half);
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;

        let (records, tail) = split_records(&data);
        if !tail.is_empty() || records.is_empty() {
            write_half.write_all(b"ERR unterminated or empty segment\n").await?;
            return Ok(());
        }

        let writer_id = Ulid::new().to_string();
        let mut seg = match self.ingest.create(&writer_id).await {
            Ok(s) => s,
            Err(e) => {
                write_half.write_all(format!("ERR {e}\n").as_bytes()).await?;
                return Ok(());
            }
        };
        for record in &records {
            if let Err(e) = seg.write_record(record).await {
                write_half.write_all(format!("ERR {e}\n").as_bytes()).await?;
                return Ok(());
            }
        }
        seg.close("close").await?;
        write_half.write_all(format!("OK {}\n", records.len()).as_bytes()).await?;
        Ok(())
    }
}
