// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The accept loop of one configured listener port.

use std::net::ToSocketAddrs;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::Sender;

use crate::config;
use crate::error::{Error, ErrorKind};
use crate::types::ListenerId;

/// A freshly accepted socket on its way to the server loop.
#[derive(Debug)]
pub struct NewStream {
    pub listener_id: ListenerId,
    pub stream: TcpStream,
}

#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    tcp_listener: TcpListener,
    sender: Sender<NewStream>,
}

impl Listener {
    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns error if the address does not resolve or the bind fails.
    pub async fn bind(
        id: ListenerId,
        listener: &config::Listener,
        sender: Sender<NewStream>,
    ) -> Result<Self, Error> {
        log::info!("bind mqtt://{}", listener.address());
        let addrs = listener.address().to_socket_addrs()?;
        for addr in addrs {
            let tcp_listener = TcpListener::bind(&addr).await?;
            return Ok(Self {
                id,
                tcp_listener,
                sender,
            });
        }
        Err(Error::from_string(
            ErrorKind::IoError,
            format!("listener: No usable address in {}", listener.address()),
        ))
    }

    pub async fn run_loop(self) {
        loop {
            match self.tcp_listener.accept().await {
                Ok((stream, address)) => {
                    log::debug!("listener: New connection from {address}");
                    if stream.set_nodelay(true).is_err() {
                        log::warn!("listener: Failed to set nodelay for {address}");
                    }
                    let cmd = NewStream {
                        listener_id: self.id,
                        stream,
                    };
                    if self.sender.send(cmd).await.is_err() {
                        log::error!("listener: Server loop is gone, stopping accepts");
                        return;
                    }
                }
                Err(err) => {
                    log::error!("listener: Accept failed on listener {}: {err}", self.id);
                }
            }
        }
    }
}
