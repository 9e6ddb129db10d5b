// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Process entry: CLI, config loading, and the single loop task that owns
//! the broker state.

use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::auth::AllowAll;
use crate::broker::Broker;
use crate::clock::SystemClock;
use crate::commands::{ConnectionToListenerCmd, ListenerToConnectionCmd};
use crate::config::Config;
use crate::connection::Connection;
use crate::constants::{CHANNEL_CAPACITY, DEFAULT_CONFIG, TICK_INTERVAL_SECS};
use crate::error::{Error, ErrorKind};
use crate::listener::{Listener, NewStream};
use crate::session::SessionConfig;
use crate::sink::ChannelSink;
use crate::types::{ListenerId, SessionId};

#[derive(Debug, Parser)]
#[command(name = "loon", version, about = "MQTT broker with session persistence")]
struct Args {
    /// Specify config file path.
    #[arg(short, long, value_name = "config_file")]
    config: Option<PathBuf>,

    /// Test config file syntax and exit.
    #[arg(short, long)]
    test: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Error> {
    let (file, required) = path.map_or((PathBuf::from(DEFAULT_CONFIG), false), |p| {
        (p.clone(), true)
    });
    if !file.exists() {
        if required {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("config: No such file {}", file.display()),
            ));
        }
        return toml::from_str("").map_err(|err| {
            Error::from_string(ErrorKind::ConfigError, format!("config: {err}"))
        });
    }
    let content = std::fs::read_to_string(&file)?;
    toml::from_str(&content).map_err(|err| {
        Error::from_string(
            ErrorKind::ConfigError,
            format!("config: Failed to parse {}: {err}", file.display()),
        )
    })
}

/// Entry point of the server binary.
///
/// # Errors
///
/// Returns error if config, logging or socket setup fails.
pub fn run_server() -> Result<(), Error> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    config.validate(true)?;

    if args.test {
        println!("The configuration syntax is Ok");
        return Ok(());
    }

    crate::log::init_log(config.log())?;
    let mut server = ServerContext::new(config);
    server.run_loop()
}

/// Resolve the per-session limits of one listener against the general
/// section.
fn session_config(config: &Config, listener_id: ListenerId) -> SessionConfig {
    let listeners = config.listeners();
    let index = listener_id as usize;
    // Without per_listener_settings the first listener's limits apply
    // everywhere; the mount point always stays per listener.
    let limits = if config.general().per_listener_settings() {
        &listeners[index]
    } else {
        &listeners[0]
    };
    SessionConfig {
        max_qos: config.general().max_qos(),
        max_inflight_messages: limits.max_inflight_messages(),
        max_inflight_bytes: limits.max_inflight_bytes(),
        max_queued_messages: limits.max_queued_messages(),
        max_queued_bytes: limits.max_queued_bytes(),
        queue_qos0_messages: limits.queue_qos0_messages(),
        max_topic_alias: limits.max_topic_alias(),
        mount_point: listeners[index].mount_point().to_string(),
    }
}

/// ServerContext manages the lifetime of the listeners and the broker
/// loop.
#[derive(Debug)]
pub struct ServerContext {
    config: Config,
}

impl ServerContext {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind all listeners and run until the process is stopped.
    ///
    /// The whole broker runs on a current-thread runtime: every session
    /// structure is only ever touched from this one thread.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime or a listener cannot be set up.
    pub fn run_loop(&mut self) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run_server_loop())
    }

    async fn run_server_loop(&mut self) -> Result<(), Error> {
        let (stream_sender, stream_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        for (index, listener_config) in self.config.listeners().iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let id = index as ListenerId;
            let listener = Listener::bind(id, listener_config, stream_sender.clone()).await?;
            tokio::spawn(listener.run_loop());
        }

        let session_configs: Vec<SessionConfig> = (0..self.config.listeners().len())
            .map(|index| {
                #[allow(clippy::cast_possible_truncation)]
                let id = index as ListenerId;
                session_config(&self.config, id)
            })
            .collect();

        let clock = Arc::new(SystemClock::new());
        let broker = Broker::new(
            self.config.general().clone(),
            clock,
            Box::new(AllowAll),
            Box::new(AllowAll),
        );
        let broker_loop = BrokerLoop::new(broker, session_configs, stream_receiver);
        broker_loop.run_loop().await;
        Ok(())
    }
}

/// The one task that owns the broker state.
struct BrokerLoop {
    broker: Broker,
    session_configs: Vec<SessionConfig>,
    stream_receiver: Receiver<NewStream>,
    conn_sender: Sender<ConnectionToListenerCmd>,
    conn_receiver: Receiver<ConnectionToListenerCmd>,
    connections: HashMap<SessionId, Sender<ListenerToConnectionCmd>>,
}

impl BrokerLoop {
    fn new(
        broker: Broker,
        session_configs: Vec<SessionConfig>,
        stream_receiver: Receiver<NewStream>,
    ) -> Self {
        let (conn_sender, conn_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            broker,
            session_configs,
            stream_receiver,
            conn_sender,
            conn_receiver,
            connections: HashMap::new(),
        }
    }

    async fn run_loop(mut self) {
        let mut tick = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));
        loop {
            tokio::select! {
                Some(new_stream) = self.stream_receiver.recv() => {
                    self.new_connection(new_stream);
                }
                Some(cmd) = self.conn_receiver.recv() => {
                    self.handle_connection_cmd(cmd);
                }
                _ = tick.tick() => {
                    self.on_tick();
                }
            }
        }
    }

    fn new_connection(&mut self, new_stream: NewStream) {
        let index = new_stream.listener_id as usize;
        let Some(config) = self.session_configs.get(index) else {
            log::error!(
                "server: No session config for listener {}",
                new_stream.listener_id
            );
            return;
        };
        let (cmd_sender, cmd_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let sink = ChannelSink::new(cmd_sender.clone());
        let id = self.broker.attach_connection(Box::new(sink), config);
        self.connections.insert(id, cmd_sender);

        let connection =
            Connection::new(id, new_stream.stream, self.conn_sender.clone(), cmd_receiver);
        tokio::spawn(connection.run_loop());
    }

    fn handle_connection_cmd(&mut self, cmd: ConnectionToListenerCmd) {
        match cmd {
            ConnectionToListenerCmd::Frame(id, frame) => {
                if let Err(err) = self.broker.handle_frame(id, &frame) {
                    log::info!("server: Closing session {id}: {err}");
                    self.close_connection(id);
                }
            }
            ConnectionToListenerCmd::Disconnected(id) => {
                self.broker.connection_closed(id);
                self.connections.remove(&id);
            }
        }
    }

    fn on_tick(&mut self) {
        for id in self.broker.tick() {
            self.close_connection(id);
        }
    }

    fn close_connection(&mut self, id: SessionId) {
        self.broker.connection_closed(id);
        if let Some(sender) = self.connections.remove(&id) {
            let _ = sender.try_send(ListenerToConnectionCmd::Close);
        }
    }
}
