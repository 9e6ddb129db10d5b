// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! One task per client socket.
//!
//! The task only shuttles bytes: complete control packets go up to the
//! server loop, encoded packets come back down. All protocol state lives
//! in the broker behind that loop.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::commands::{ConnectionToListenerCmd, ListenerToConnectionCmd};
use crate::types::SessionId;

/// Read one complete control packet: fixed header byte, remaining-length
/// varint, body. Returns `None` on a clean EOF between packets.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut first = [0_u8; 1];
    match reader.read_exact(&mut first).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let mut frame = vec![first[0]];

    let mut remaining: usize = 0;
    let mut multiplier: usize = 1;
    loop {
        let mut byte = [0_u8; 1];
        reader.read_exact(&mut byte).await?;
        frame.push(byte[0]);
        remaining += usize::from(byte[0] & 0x7f) * multiplier;
        if multiplier > 128 * 128 * 128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "remaining length varint longer than 4 bytes",
            ));
        }
        multiplier *= 128;
        if byte[0] & 0x80 == 0 {
            break;
        }
    }

    let body_start = frame.len();
    frame.resize(body_start + remaining, 0);
    reader.read_exact(&mut frame[body_start..]).await?;
    Ok(Some(frame))
}

#[derive(Debug)]
pub struct Connection {
    id: SessionId,
    stream: TcpStream,
    sender: Sender<ConnectionToListenerCmd>,
    receiver: Receiver<ListenerToConnectionCmd>,
}

impl Connection {
    #[must_use]
    pub fn new(
        id: SessionId,
        stream: TcpStream,
        sender: Sender<ConnectionToListenerCmd>,
        receiver: Receiver<ListenerToConnectionCmd>,
    ) -> Self {
        Self {
            id,
            stream,
            sender,
            receiver,
        }
    }

    pub async fn run_loop(self) {
        let Self {
            id,
            stream,
            sender,
            mut receiver,
        } = self;
        let (mut reader, mut writer) = stream.into_split();

        // Reads get their own task so a slow write never stalls them, and
        // a cancelled read cannot tear a packet in half.
        let read_sender = sender.clone();
        let mut read_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if read_sender
                            .send(ConnectionToListenerCmd::Frame(id, frame))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log::info!("connection: Read error on session {id}: {err}");
                        break;
                    }
                }
            }
        });

        loop {
            tokio::select! {
                cmd = receiver.recv() => match cmd {
                    Some(ListenerToConnectionCmd::Send(bytes)) => {
                        if let Err(err) = writer.write_all(&bytes).await {
                            log::info!("connection: Write error on session {id}: {err}");
                            break;
                        }
                    }
                    Some(ListenerToConnectionCmd::Close) | None => break,
                },
                _ = &mut read_task => break,
            }
        }

        read_task.abort();
        if let Err(err) = sender.send(ConnectionToListenerCmd::Disconnected(id)).await {
            log::error!("connection: Failed to send disconnect cmd for {id}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_frame_splits_packets() {
        tokio_test::block_on(async {
            let (mut client, mut server) = tokio::io::duplex(64);
            // PINGREQ followed by DISCONNECT in one burst.
            client.write_all(&[0xc0, 0x00, 0xe0, 0x00]).await.unwrap();

            let frame = read_frame(&mut server).await.unwrap().unwrap();
            assert_eq!(frame, vec![0xc0, 0x00]);
            let frame = read_frame(&mut server).await.unwrap().unwrap();
            assert_eq!(frame, vec![0xe0, 0x00]);

            drop(client);
            assert!(read_frame(&mut server).await.unwrap().is_none());
        });
    }

    #[test]
    fn test_read_frame_multi_byte_length() {
        tokio_test::block_on(async {
            let (mut client, mut server) = tokio::io::duplex(512);
            let mut packet = vec![0x30, 0x80, 0x01];
            packet.extend_from_slice(&[0_u8; 128]);
            client.write_all(&packet).await.unwrap();

            let frame = read_frame(&mut server).await.unwrap().unwrap();
            assert_eq!(frame.len(), 3 + 128);
        });
    }

    #[test]
    fn test_read_frame_rejects_overlong_varint() {
        tokio_test::block_on(async {
            let (mut client, mut server) = tokio::io::duplex(64);
            client
                .write_all(&[0x30, 0x80, 0x80, 0x80, 0x80, 0x01])
                .await
                .unwrap();
            assert!(read_frame(&mut server).await.is_err());
        });
    }
}
