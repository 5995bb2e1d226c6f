//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bgpd_utils::{Receiver, Sender, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use tokio::io::ReadHalf;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::debug::Debug;
use crate::error::{Error, IoError, NbrRxError};
use crate::fsm::{
    AdminState, AdminStateOp, IDLE_HOLD_TIME, LARGE_HOLDTIME, SharedFsm,
    State, StateReason, open,
};
use crate::network::{
    Connection, MessageDecoder, MessageWriter, Session, Stream,
};
use crate::packet::codec::MessageCodec;
use crate::packet::consts::{CeaseSubcode, ErrorCode, FsmErrorSubcode};
use crate::packet::error::{ErrorHandling, MessageError};
use crate::packet::message::{
    KeepaliveMsg, Message, NotificationMsg, UpdateMsg,
};
use crate::path::{Path, PeerInfo, updates_from_paths};
use crate::tasks;
use crate::tasks::messages::input::{FsmEvent, FsmMsg};
use crate::tasks::messages::output::{Outgoing, Resume};

// Time given to the Tx task to flush a final NOTIFICATION.
const NOTIFICATION_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// Outgoing queue of an established session.
type OutgoingQueue = (UnboundedSender<Outgoing>, UnboundedReceiver<Outgoing>);

// Runs the per-state event loops of one peer.
//
// Every transition is reported to the central loop, which acknowledges it
// with a `Resume` message once the RIB-level consequences were handled.
#[derive(Debug)]
pub struct FsmHandler {
    pub addr: IpAddr,
    fsm: SharedFsm,
    codec: Arc<dyn MessageCodec>,
    token: CancellationToken,
    conn_tx: Sender<Connection>,
    conn_rx: Receiver<Connection>,
    admin_rx: Receiver<AdminStateOp>,
    fsm_tx: UnboundedSender<FsmMsg>,
    resume_rx: Receiver<Resume>,
    outgoing: Option<OutgoingQueue>,
    session: Option<Session>,
    gr_timer: Option<Pin<Box<Sleep>>>,
}

// State shared by the Rx and Tx tasks of an established session.
#[derive(Clone, Debug)]
pub(crate) struct SessionCxt {
    pub addr: IpAddr,
    pub version: u64,
    pub fsm: SharedFsm,
    pub fsm_tx: UnboundedSender<FsmMsg>,
    pub reason_tx: mpsc::Sender<StateReason>,
}

// Outcome of reading one message from the session.
enum Rx {
    Msg(Message),
    DecodeError(MessageError),
    Failed,
}

// ===== impl FsmHandler =====

impl FsmHandler {
    pub(crate) fn new(
        fsm: SharedFsm,
        codec: Arc<dyn MessageCodec>,
        token: CancellationToken,
        (conn_tx, conn_rx): (Sender<Connection>, Receiver<Connection>),
        admin_rx: Receiver<AdminStateOp>,
        fsm_tx: UnboundedSender<FsmMsg>,
        resume_rx: Receiver<Resume>,
    ) -> FsmHandler {
        let addr = fsm.read().addr;
        FsmHandler {
            addr,
            fsm,
            codec,
            token,
            conn_tx,
            conn_rx,
            admin_rx,
            fsm_tx,
            resume_rx,
            outgoing: None,
            session: None,
            gr_timer: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let state = self.fsm.read().state;
            let token = self.token.clone();
            let (next_state, reason) = tokio::select! {
                biased;
                _ = token.cancelled() => (State::Idle, StateReason::Dying),
                transition = self.run_state(state) => transition,
            };

            // Leaving a connected state closes the connection.
            if next_state == State::Idle {
                self.session = None;
            }

            // Report the transition.
            let dying = reason == StateReason::Dying;
            let version = self.fsm.read().version;
            let event = FsmEvent::StateChange {
                state: next_state,
                reason,
            };
            let msg = FsmMsg::new(self.addr, version, event);
            if self.fsm_tx.send(msg).is_err() || dying {
                return;
            }

            // Wait for the central loop to process the transition.
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                resume = self.resume_rx.recv() => match resume {
                    Some(resume) => self.outgoing = resume.outgoing,
                    None => return,
                },
            }
        }
    }

    async fn run_state(&mut self, state: State) -> (State, StateReason) {
        match state {
            State::Idle => self.idle().await,
            State::Active => self.active().await,
            State::OpenSent => self.opensent().await,
            State::OpenConfirm => self.openconfirm().await,
            State::Established => self.established().await,
        }
    }

    async fn idle(&mut self) -> (State, StateReason) {
        let (idle_hold_time, admin_up) = {
            let fsm = self.fsm.read();
            (fsm.idle_hold_time, fsm.admin_state == AdminState::Up)
        };
        let mut idle_timer = admin_up.then(|| timer(idle_hold_time));

        loop {
            tokio::select! {
                _ = timer_expired(&mut self.gr_timer) => {
                    if self.fsm.read().gr.peer_restarting {
                        warn!("graceful restart timer expired");
                        return (State::Idle, StateReason::RestartTimerExpired);
                    }
                }
                Some(conn) = self.conn_rx.recv() => {
                    reject_connection(conn, State::Idle);
                }
                _ = timer_expired(&mut idle_timer) => {
                    let mut fsm = self.fsm.write();
                    if fsm.admin_state == AdminState::Up {
                        fsm.idle_hold_time = IDLE_HOLD_TIME;
                        return (State::Active, StateReason::IdleTimerExpired);
                    }
                }
                Some(op) = self.admin_rx.recv() => {
                    if change_admin_state(&self.fsm, &op) {
                        idle_timer = match op.state {
                            AdminState::Up => {
                                let idle_hold_time =
                                    self.fsm.read().idle_hold_time;
                                Some(timer(idle_hold_time))
                            }
                            AdminState::Down | AdminState::PfxCt => None,
                        };
                    }
                }
            }
        }
    }

    async fn active(&mut self) -> (State, StateReason) {
        // A restarting peer is expected to reconnect by itself.
        let _connect_task = {
            let fsm = self.fsm.read();
            (!fsm.config.transport.passive_mode && !fsm.gr.peer_restarting)
                .then(|| tasks::tcp_connect(&fsm, &self.conn_tx))
        };

        loop {
            tokio::select! {
                _ = timer_expired(&mut self.gr_timer) => {
                    if self.fsm.read().gr.peer_restarting {
                        warn!("graceful restart timer expired");
                        return (State::Idle, StateReason::RestartTimerExpired);
                    }
                }
                Some(conn) = self.conn_rx.recv() => {
                    match self.connection_setup(conn) {
                        Ok(()) => {
                            return (
                                State::OpenSent,
                                StateReason::NewConnection,
                            );
                        }
                        Err(error) => {
                            IoError::TcpSocketError(error).log();
                        }
                    }
                }
                Some(op) = self.admin_rx.recv() => {
                    if change_admin_state(&self.fsm, &op)
                        && op.state != AdminState::Up
                    {
                        return (State::Idle, StateReason::AdminDown);
                    }
                }
            }
        }
    }

    async fn opensent(&mut self) -> (State, StateReason) {
        let Some(session) = self.session.as_mut() else {
            error!("no connection in the opensent state");
            return (State::Idle, StateReason::ReadFailed);
        };
        let write_timeout = write_timeout(LARGE_HOLDTIME);

        // Send OPEN message.
        let msg = {
            let mut fsm = self.fsm.write();
            let msg = open::build_open(&fsm);
            fsm.open_sent = Some(msg.clone());
            Message::Open(msg)
        };
        let result =
            send_message(&self.fsm, &mut session.writer, &msg, write_timeout);
        if let Err(error) = result.await {
            error.log();
            return (State::Idle, StateReason::WriteFailed);
        }

        let mut hold_timer = timer(LARGE_HOLDTIME);
        loop {
            tokio::select! {
                _ = timer_expired(&mut self.gr_timer) => {
                    if self.fsm.read().gr.peer_restarting {
                        warn!("graceful restart timer expired");
                        return (State::Idle, StateReason::RestartTimerExpired);
                    }
                }
                Some(conn) = self.conn_rx.recv() => {
                    reject_connection(conn, State::OpenSent);
                }
                msg = session.reader.next() => {
                    let notif = match rx_result(&self.fsm, msg) {
                        Rx::Msg(Message::Open(msg)) => {
                            let result =
                                open::process_open(&mut self.fsm.write(), &msg);
                            match result {
                                Ok(()) => {
                                    session.update_cxt(
                                        self.fsm.read().codec_cxt(),
                                    );

                                    // Send Keepalive message.
                                    let msg =
                                        Message::Keepalive(KeepaliveMsg {});
                                    let result = send_message(
                                        &self.fsm,
                                        &mut session.writer,
                                        &msg,
                                        write_timeout,
                                    );
                                    if let Err(error) = result.await {
                                        error.log();
                                        return (
                                            State::Idle,
                                            StateReason::WriteFailed,
                                        );
                                    }
                                    return (
                                        State::OpenConfirm,
                                        StateReason::OpenMsgReceived,
                                    );
                                }
                                Err(error) => {
                                    error.log();
                                    error.notification()
                                }
                            }
                        }
                        Rx::Msg(Message::Notification(msg)) => {
                            return (
                                State::Idle,
                                StateReason::NotificationRecv(msg),
                            );
                        }
                        Rx::Msg(_) => Some(NotificationMsg::new(
                            ErrorCode::FiniteStateMachineError,
                            FsmErrorSubcode::UnexpectedMessageInOpenSent,
                        )),
                        Rx::DecodeError(error) => Some((&error).into()),
                        Rx::Failed => {
                            return (State::Idle, StateReason::ReadFailed);
                        }
                    };
                    if let Some(notif) = notif {
                        let msg = Message::Notification(notif);
                        let _ = send_message(
                            &self.fsm,
                            &mut session.writer,
                            &msg,
                            write_timeout,
                        )
                        .await;
                    }
                    return (State::Idle, StateReason::InvalidMsg);
                }
                _ = &mut hold_timer => {
                    let msg = Message::Notification(NotificationMsg::new(
                        ErrorCode::HoldTimerExpired,
                        0,
                    ));
                    let _ = send_message(
                        &self.fsm,
                        &mut session.writer,
                        &msg,
                        write_timeout,
                    )
                    .await;
                    return (State::Idle, StateReason::HoldTimerExpired);
                }
                Some(op) = self.admin_rx.recv() => {
                    if change_admin_state(&self.fsm, &op)
                        && op.state != AdminState::Up
                    {
                        let msg = Message::Notification(
                            NotificationMsg::with_communication(
                                CeaseSubcode::AdministrativeShutdown,
                                &op.communication,
                            ),
                        );
                        let _ = send_message(
                            &self.fsm,
                            &mut session.writer,
                            &msg,
                            write_timeout,
                        )
                        .await;
                        return (State::Idle, StateReason::AdminDown);
                    }
                }
            }
        }
    }

    async fn openconfirm(&mut self) -> (State, StateReason) {
        let Some(session) = self.session.as_mut() else {
            error!("no connection in the openconfirm state");
            return (State::Idle, StateReason::ReadFailed);
        };
        let (hold_time, keepalive_interval) = {
            let fsm = self.fsm.read();
            (fsm.hold_time, fsm.keepalive_interval)
        };
        let write_timeout = write_timeout(hold_time);
        let mut hold_timer = (hold_time != 0).then(|| timer(hold_time));
        let mut keepalive = keepalive_ticker(hold_time, keepalive_interval);

        loop {
            let notif = tokio::select! {
                _ = timer_expired(&mut self.gr_timer) => {
                    if self.fsm.read().gr.peer_restarting {
                        warn!("graceful restart timer expired");
                        return (State::Idle, StateReason::RestartTimerExpired);
                    }
                    continue;
                }
                Some(conn) = self.conn_rx.recv() => {
                    reject_connection(conn, State::OpenConfirm);
                    continue;
                }
                _ = ticker_tick(&mut keepalive) => {
                    let msg = Message::Keepalive(KeepaliveMsg {});
                    let result = send_message(
                        &self.fsm,
                        &mut session.writer,
                        &msg,
                        write_timeout,
                    );
                    if let Err(error) = result.await {
                        error.log();
                        return (State::Idle, StateReason::WriteFailed);
                    }
                    continue;
                }
                msg = session.reader.next() => {
                    match rx_result(&self.fsm, msg) {
                        Rx::Msg(Message::Keepalive(_)) => {
                            return (
                                State::Established,
                                StateReason::OpenMsgNegotiated,
                            );
                        }
                        Rx::Msg(Message::Notification(msg)) => {
                            return (
                                State::Idle,
                                StateReason::NotificationRecv(msg),
                            );
                        }
                        Rx::Msg(_) => (
                            NotificationMsg::new(
                                ErrorCode::FiniteStateMachineError,
                                FsmErrorSubcode::UnexpectedMessageInOpenConfirm,
                            ),
                            StateReason::InvalidMsg,
                        ),
                        Rx::DecodeError(error) => {
                            ((&error).into(), StateReason::InvalidMsg)
                        }
                        Rx::Failed => {
                            return (State::Idle, StateReason::ReadFailed);
                        }
                    }
                }
                _ = timer_expired(&mut hold_timer) => (
                    NotificationMsg::new(ErrorCode::HoldTimerExpired, 0),
                    StateReason::HoldTimerExpired,
                ),
                Some(op) = self.admin_rx.recv() => {
                    if !change_admin_state(&self.fsm, &op)
                        || op.state == AdminState::Up
                    {
                        continue;
                    }
                    (
                        NotificationMsg::with_communication(
                            CeaseSubcode::AdministrativeShutdown,
                            &op.communication,
                        ),
                        StateReason::AdminDown,
                    )
                }
            };

            // Send NOTIFICATION message and close the session.
            let (notif, reason) = notif;
            let msg = Message::Notification(notif);
            let _ = send_message(
                &self.fsm,
                &mut session.writer,
                &msg,
                write_timeout,
            )
            .await;
            return (State::Idle, reason);
        }
    }

    async fn established(&mut self) -> (State, StateReason) {
        // Stop the graceful restart timer.
        self.gr_timer = None;

        let (Some(session), Some((outgoing_tx, outgoing_rx))) =
            (self.session.take(), self.outgoing.take())
        else {
            error!("session not ready in the established state");
            return (State::Idle, StateReason::ReadFailed);
        };
        let (hold_time, version) = {
            let fsm = self.fsm.read();
            (fsm.hold_time, fsm.version)
        };

        // Start the Rx and Tx tasks.
        let (reason_tx, mut reason_rx) = mpsc::channel(4);
        let (hold_reset_tx, mut hold_reset_rx) = mpsc::channel(1);
        let cxt = SessionCxt {
            addr: self.addr,
            version,
            fsm: self.fsm.clone(),
            fsm_tx: self.fsm_tx.clone(),
            reason_tx,
        };
        let Session { reader, writer, .. } = session;
        let _rx_task = tasks::nbr_rx(&cxt, reader, hold_reset_tx);
        let mut tx_task = tasks::nbr_tx(&cxt, writer, outgoing_rx);

        let hold = Duration::from_secs(hold_time.into());
        let mut hold_timer = (hold_time != 0).then(|| timer(hold_time));
        loop {
            tokio::select! {
                biased;
                Some(reason) = reason_rx.recv() => {
                    return self.established_exit(reason);
                }
                Some(conn) = self.conn_rx.recv() => {
                    reject_connection(conn, State::Established);
                }
                Some(()) = hold_reset_rx.recv() => {
                    if let Some(hold_timer) = &mut hold_timer {
                        hold_timer.as_mut().reset(Instant::now() + hold);
                    }
                }
                _ = timer_expired(&mut hold_timer) => {
                    warn!("hold timer expired");
                    let msg =
                        NotificationMsg::new(ErrorCode::HoldTimerExpired, 0);
                    let _ = outgoing_tx.send(Outgoing::notification(msg));

                    // Give the Tx task a chance to flush the NOTIFICATION.
                    let _ = tokio::time::timeout(
                        NOTIFICATION_FLUSH_TIMEOUT,
                        &mut tx_task,
                    )
                    .await;
                    return (State::Idle, StateReason::HoldTimerExpired);
                }
                Some(op) = self.admin_rx.recv() => {
                    if change_admin_state(&self.fsm, &op)
                        && op.state != AdminState::Up
                    {
                        let msg = NotificationMsg::with_communication(
                            CeaseSubcode::AdministrativeShutdown,
                            &op.communication,
                        );
                        let _ = outgoing_tx.send(Outgoing::notification(msg));
                    }
                }
            }
        }
    }

    // Converts session failures into graceful restarts (RFC 4724) or hard
    // resets (RFC 8538) according to the negotiated capabilities.
    fn established_exit(
        &mut self,
        reason: StateReason,
    ) -> (State, StateReason) {
        let (gr_enabled, notification_enabled, restart_time) = {
            let fsm = self.fsm.read();
            (
                fsm.gr.enabled,
                fsm.gr.enabled && fsm.gr.notification_enabled,
                fsm.gr.peer_restart_time,
            )
        };
        let reason = match reason {
            StateReason::NotificationRecv(msg)
                if notification_enabled
                    && msg.is_cease(CeaseSubcode::HardReset) =>
            {
                StateReason::HardReset
            }
            StateReason::NotificationRecv(_) if notification_enabled => {
                StateReason::GracefulRestart
            }
            StateReason::ReadFailed | StateReason::WriteFailed
                if gr_enabled =>
            {
                StateReason::GracefulRestart
            }
            reason => reason,
        };
        if reason == StateReason::GracefulRestart {
            self.gr_timer = Some(timer(restart_time));
        }
        (State::Idle, reason)
    }

    // Applies the socket options to a new connection and starts a session
    // over it.
    fn connection_setup(
        &mut self,
        conn: Connection,
    ) -> Result<(), std::io::Error> {
        {
            let mut fsm = self.fsm.write();
            conn.init(fsm.tx_ttl(), fsm.min_ttl())?;

            let mut peer_info = (*fsm.peer_info).clone();
            if let Some(local) = conn.info.local {
                peer_info.local_address = Some(local.ip());
            }
            fsm.peer_info = Arc::new(peer_info);
            fsm.conn_info = Some(conn.info);
        }
        self.session = Some(conn.into_session(self.codec.clone()));
        Ok(())
    }
}

// ===== impl SessionCxt =====

impl SessionCxt {
    fn send(&self, event: FsmEvent) {
        let msg = FsmMsg::new(self.addr, self.version, event);
        let _ = self.fsm_tx.send(msg);
    }
}

// ===== global functions =====

// Reads messages from an established session.
pub(crate) async fn nbr_read_loop(
    cxt: SessionCxt,
    mut reader: FramedRead<ReadHalf<Stream>, MessageDecoder>,
    hold_resetp: mpsc::Sender<()>,
) {
    let peer_info = cxt.fsm.read().peer_info.clone();

    loop {
        let msg = match rx_result(&cxt.fsm, reader.next().await) {
            Rx::Msg(msg) => msg,
            Rx::DecodeError(error) => {
                cxt.send(FsmEvent::MessageError(error));
                return;
            }
            Rx::Failed => {
                let _ = cxt.reason_tx.send(StateReason::ReadFailed).await;
                return;
            }
        };

        match msg {
            Message::Update(msg) => {
                let _ = hold_resetp.try_send(());
                match process_update(&cxt, &peer_info, msg) {
                    Ok(Some(event)) => cxt.send(event),
                    Ok(None) => (),
                    Err(error) => {
                        cxt.send(FsmEvent::MessageError(error));
                        return;
                    }
                }
            }
            Message::Keepalive(_) => {
                let _ = hold_resetp.try_send(());
            }
            Message::RouteRefresh(msg) => {
                let _ = hold_resetp.try_send(());
                match msg.family() {
                    Some(family) => cxt.send(FsmEvent::RouteRefresh(family)),
                    None => {
                        warn!(afi = ?msg.afi, safi = ?msg.safi,
                            "ROUTE-REFRESH for unknown address family");
                    }
                }
            }
            Message::Notification(msg) => {
                let reason = StateReason::NotificationRecv(msg);
                let _ = cxt.reason_tx.send(reason).await;
                return;
            }
            Message::Open(_) => {
                let error = MessageError::session_reset(
                    ErrorCode::FiniteStateMachineError,
                    FsmErrorSubcode::UnexpectedMessageInEstablished,
                    "unexpected OPEN message",
                );
                cxt.send(FsmEvent::MessageError(error));
                return;
            }
        }
    }
}

// Writes the outgoing batches and keepalives of an established session.
pub(crate) async fn nbr_write_loop(
    cxt: SessionCxt,
    mut writer: MessageWriter,
    mut outgoing_rx: UnboundedReceiver<Outgoing>,
) {
    let (hold_time, keepalive_interval) = {
        let fsm = cxt.fsm.read();
        (fsm.hold_time, fsm.keepalive_interval)
    };
    let write_timeout = write_timeout(hold_time);
    let mut keepalive = keepalive_ticker(hold_time, keepalive_interval);

    let reason = loop {
        tokio::select! {
            biased;
            Some(msg) = outgoing_rx.recv() => {
                let result =
                    send_outgoing(&cxt, &mut writer, msg, write_timeout).await;
                if let Some(reason) = result {
                    break reason;
                }
            }
            _ = ticker_tick(&mut keepalive) => {
                let msg = Message::Keepalive(KeepaliveMsg {});
                let result =
                    send_message(&cxt.fsm, &mut writer, &msg, write_timeout);
                if let Err(error) = result.await {
                    error.log();
                    break StateReason::WriteFailed;
                }
            }
        }
    };
    let _ = cxt.reason_tx.send(reason).await;
}

// ===== helper functions =====

fn timer(seconds: u16) -> Pin<Box<Sleep>> {
    Box::pin(tokio::time::sleep(Duration::from_secs(seconds.into())))
}

// Completes when the timer expires, disarming it. Unarmed timers never
// expire.
async fn timer_expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => {
            sleep.as_mut().await;
            *timer = None;
        }
        None => std::future::pending().await,
    }
}

fn keepalive_ticker(
    hold_time: u16,
    keepalive_interval: u16,
) -> Option<Interval> {
    if hold_time == 0 {
        return None;
    }
    let seconds = match keepalive_interval {
        0 => hold_time / 3,
        seconds => seconds,
    };
    let period = Duration::from_secs(std::cmp::max(seconds, 1).into());
    let start = Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn ticker_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn write_timeout(hold_time: u16) -> Option<Duration> {
    (hold_time != 0).then(|| Duration::from_secs(hold_time.into()))
}

fn reject_connection(conn: Connection, state: State) {
    debug!(remote = %conn.info.remote, %state, "closing new connection");
}

// Applies an administrative state change request. Returns whether the
// state changed.
fn change_admin_state(fsm: &SharedFsm, op: &AdminStateOp) -> bool {
    let mut fsm = fsm.write();
    if !fsm.change_admin_state(op.state) {
        warn!(state = ?op.state, "administrative state unchanged");
        return false;
    }
    Debug::AdminStateChange(&fsm.addr, &op.state).log();
    if op.state == AdminState::Up {
        fsm.idle_hold_time = 0;
    }
    true
}

fn rx_result(
    fsm: &SharedFsm,
    msg: Option<Result<Message, NbrRxError>>,
) -> Rx {
    let addr = fsm.read().addr;
    match msg {
        Some(Ok(msg)) => {
            Debug::MsgRx(&addr, &msg).log();
            fsm.write().statistics.msgs_rcvd.update(&msg);
            Rx::Msg(msg)
        }
        Some(Err(NbrRxError::MsgDecodeError(error))) => {
            Error::NbrRxError(addr, NbrRxError::MsgDecodeError(error.clone()))
                .log();
            Rx::DecodeError(error)
        }
        Some(Err(error)) => {
            Error::NbrRxError(addr, error).log();
            Rx::Failed
        }
        None => {
            Error::NbrRxError(addr, NbrRxError::TcpConnClosed).log();
            Rx::Failed
        }
    }
}

// Performs RFC 7606 error handling on a received UPDATE and builds the
// corresponding FSM event.
fn process_update(
    cxt: &SessionCxt,
    peer_info: &Arc<PeerInfo>,
    mut msg: UpdateMsg,
) -> Result<Option<FsmEvent>, MessageError> {
    let result = msg.validate(&cxt.fsm.read().families);
    if let Err(error) = result {
        match error.handling {
            ErrorHandling::SessionReset => return Err(error),
            ErrorHandling::AfiSafiDisable => {
                warn!(reason = %error.reason, "discarding UPDATE");
                cxt.fsm.write().statistics.msgs_rcvd.discarded += 1;
                return Ok(None);
            }
            ErrorHandling::TreatAsWithdraw => {
                warn!(reason = %error.reason, "treating UPDATE as withdraw");
                msg.treat_as_withdraw();
            }
            ErrorHandling::AttributeDiscard | ErrorHandling::None => {
                debug!(reason = %error.reason, "ignoring UPDATE error");
            }
        }
    }

    let eor = msg.eor_family();
    let paths = match eor {
        Some(_) => vec![],
        None => Path::from_update(peer_info, &msg),
    };
    Ok(Some(FsmEvent::Update { msg, paths, eor }))
}

async fn send_outgoing(
    cxt: &SessionCxt,
    writer: &mut MessageWriter,
    msg: Outgoing,
    write_timeout: Option<Duration>,
) -> Option<StateReason> {
    if msg.stay_idle {
        cxt.fsm.write().admin_state = AdminState::PfxCt;
    }

    for update in updates_from_paths(&msg.paths, &msg.eor) {
        let update = Message::Update(update);
        let result = send_message(&cxt.fsm, writer, &update, write_timeout);
        if let Err(error) = result.await {
            error.log();
            return Some(StateReason::WriteFailed);
        }
    }
    if !msg.eor.is_empty() {
        let mut fsm = cxt.fsm.write();
        for family in &msg.eor {
            fsm.gr.families.entry(*family).or_default().eor_sent = true;
        }
    }

    // Send NOTIFICATION message and close the session.
    if let Some(notif) = msg.notification {
        let msg = Message::Notification(notif.clone());
        let _ = send_message(&cxt.fsm, writer, &msg, write_timeout).await;
        return Some(StateReason::NotificationSent(notif));
    }

    None
}

async fn send_message(
    fsm: &SharedFsm,
    writer: &mut MessageWriter,
    msg: &Message,
    write_timeout: Option<Duration>,
) -> Result<(), IoError> {
    let addr = fsm.read().addr;
    Debug::MsgTx(&addr, msg).log();

    let result = match write_timeout {
        Some(write_timeout) => {
            tokio::time::timeout(write_timeout, writer.send(msg))
                .await
                .unwrap_or_else(|_| {
                    Err(std::io::Error::from(std::io::ErrorKind::TimedOut))
                })
        }
        None => writer.send(msg).await,
    };
    result.map_err(IoError::TcpSendError)?;

    fsm.write().statistics.msgs_sent.update(msg);
    Ok(())
}
