//! Top-level client: owns the shared tables and drives every component
//! from one cooperative `tick()`.
//!
//! The embedding application constructs a [`Client`], registers callbacks,
//! calls [`Client::start`], and then awaits [`Client::tick`] from its driver
//! loop. Nothing here spawns tasks; all I/O happens inside the tick.

use crate::config::ClientConfig;
use crate::connector::{Connector, TlsConnector};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::schedule::{JobMode, ScheduleEngine, ScheduleJob};
use crate::session::SessionProvider;
use crate::store::{ChannelStore, ChannelValue};
use crate::transport::{SocketState, StreamTransport};
use crate::writer::BatchWriter;
use chrono::Utc;

pub struct Client<S: SessionProvider> {
    session: S,
    connector: Box<dyn Connector>,
    transport: StreamTransport,
    channels: ChannelStore,
    schedules: ScheduleEngine,
    writer: BatchWriter,
    started: bool,
}

impl<S: SessionProvider> Client<S> {
    /// Build a client with the default TLS connector.
    pub fn new(config: ClientConfig, session: S) -> Result<Self> {
        Self::with_connector(config, session, Box::new(TlsConnector::new()))
    }

    /// Build a client with a caller-supplied socket connector.
    pub fn with_connector(
        config: ClientConfig,
        session: S,
        connector: Box<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let transport = StreamTransport::new(
            config.host.clone(),
            config.stream_path(),
            config.update_interval,
            config.reconnect_backoff,
            config.max_redirects,
        );
        let channels = ChannelStore::new(
            config.channel_count,
            config.max_value_len,
            config.writer_id.clone(),
            config.notify_on_resync,
        );
        let schedules = ScheduleEngine::new(config.schedule_capacity, config.channel_count);
        let writer = BatchWriter::new(
            config.host.clone(),
            config.writer_id.clone(),
            config.batch_interval,
            config.heartbeat_interval,
            config.heartbeat_penalty,
            config.heartbeat_enabled,
        );
        Ok(Self {
            session,
            connector,
            transport,
            channels,
            schedules,
            writer,
            started: false,
        })
    }

    /// Start communicating. Call once the network is up; idempotent.
    pub fn start(&mut self) {
        self.started = true;
        self.transport.start();
    }

    /// Tear down the stream and suspend all activity. Safe at any time.
    pub fn stop(&mut self) {
        self.started = false;
        self.transport.stop();
    }

    /// Suspend the stream without forgetting state; [`Client::resume`]
    /// picks it back up.
    pub fn pause(&mut self) {
        self.transport.stop();
    }

    pub fn resume(&mut self) {
        if self.started {
            self.transport.start();
        }
    }

    /// One cooperative pass over every component. Call this repeatedly from
    /// the driver loop; it returns promptly in steady state.
    pub async fn tick(&mut self) {
        if !self.started || !self.session.ready() || self.session.is_expired() {
            return;
        }

        let mut dispatcher = Dispatcher {
            channels: &mut self.channels,
            schedules: &mut self.schedules,
        };
        self.transport
            .tick(self.connector.as_mut(), &self.session, &mut dispatcher)
            .await;

        self.schedules.tick(Utc::now(), &mut self.channels);

        // Outbound work waits until the subscribe path carries a real
        // identity; the transport resolves it on its first ready tick.
        if self.transport.identity_resolved() {
            self.writer
                .tick(
                    self.connector.as_mut(),
                    &self.session,
                    self.transport.path(),
                    &mut self.channels,
                )
                .await;
        }
    }

    /// Queue a value for the next outbound batch.
    pub fn channel_write(&mut self, channel: usize, value: &str) -> Result<()> {
        self.channels.write(channel, value)
    }

    pub fn channel_write_i64(&mut self, channel: usize, value: i64) -> Result<()> {
        self.channels.write(channel, &value.to_string())
    }

    pub fn channel_write_f64(&mut self, channel: usize, value: f64) -> Result<()> {
        self.channels.write(channel, &value.to_string())
    }

    /// Last accepted value for a channel, from any source.
    pub fn channel_last_value(&self, channel: usize) -> Result<ChannelValue<'_>> {
        self.channels.last_value(channel)
    }

    /// Register the update callback for one channel.
    pub fn on_channel(
        &mut self,
        channel: usize,
        callback: impl FnMut(&str, bool) + Send + 'static,
    ) -> Result<()> {
        self.channels.set_callback(channel, Box::new(callback))
    }

    /// Register the callback invoked when a schedule job fires.
    pub fn on_schedule(
        &mut self,
        id: usize,
        callback: impl FnMut(&ScheduleJob, &str) + Send + 'static,
    ) -> Result<()> {
        self.schedules.set_callback(id, Box::new(callback))
    }

    /// Install a schedule job locally (jobs normally arrive over the
    /// stream).
    pub fn install_schedule(
        &mut self,
        id: usize,
        cron: &str,
        channel: usize,
        mode: JobMode,
        operand: &str,
    ) -> Result<()> {
        self.schedules
            .install(id, cron, channel, mode, operand, Utc::now())
    }

    pub fn schedule(&self, id: usize) -> Option<&ScheduleJob> {
        self.schedules.job(id)
    }

    pub fn stream_state(&self) -> SocketState {
        self.transport.state()
    }

    pub fn is_streaming(&self) -> bool {
        self.transport.is_streaming()
    }

    pub fn user_uid(&self) -> Option<&str> {
        if self.session.ready() {
            self.session.user_uid()
        } else {
            None
        }
    }
}
