//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bgpd_utils::socket::TcpListener;
use bgpd_utils::task::{Task, TimeoutTask};
use bgpd_utils::{Sender, UnboundedReceiver};
use rand::Rng;
use tokio::io::ReadHalf;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug_span, error};

use crate::af::RouteFamily;
use crate::fsm::handler::{self, FsmHandler, SessionCxt};
use crate::fsm::{Fsm, MIN_CONNECT_RETRY, StateReason};
use crate::network::{
    self, Connection, MessageDecoder, MessageWriter, Stream,
};
use crate::tasks::messages::input::TimerMsg;
use crate::tasks::messages::output::Outgoing;

//
// BGP tasks diagram:
//                                     +--------------+
//                                     |  management  |
//                                     +--------------+
//                                           | ^
//                                           | |
//                           mgmt_rx (1x)    V | (1x) responder
//                                     +--------------+
//                                     |              |
//                tcp_listener (Nx) -> |              |
//                   peer_fsm (Nx)  -> |              | -> (Nx) peer_fsm
//                      nbr_rx (Nx) -> |    server    | -> (Nx) nbr_tx
//                  llgr_timer (Nx) -> |              |
//              deferral_timer (Nx) -> |              | -> (Nx) watchers
//                                     |              |
//                                     +--------------+
//
//                                     +--------------+
//                 tcp_connect (1x) -> |   peer_fsm   | <- (1x) nbr_tx
//                      nbr_rx (1x) -> |              |
//                                     +--------------+
//

// BGP inter-task message types.
pub mod messages {
    use std::net::IpAddr;

    use chrono::{DateTime, Utc};

    use crate::af::RouteFamily;
    use crate::fsm::{State, StateReason};
    use crate::packet::error::MessageError;
    use crate::packet::message::{NotificationMsg, UpdateMsg};
    use crate::path::Path;

    // Input messages (child task -> main task).
    pub mod input {
        use super::*;

        // Event generated by a peer's FSM tasks.
        #[derive(Debug)]
        pub struct FsmMsg {
            pub addr: IpAddr,
            // Generation of the FSM when the message was generated.
            pub version: u64,
            pub timestamp: DateTime<Utc>,
            pub event: FsmEvent,
        }

        #[derive(Debug)]
        pub enum FsmEvent {
            StateChange {
                state: State,
                reason: StateReason,
            },
            Update {
                msg: UpdateMsg,
                paths: Vec<Path>,
                eor: Option<RouteFamily>,
            },
            RouteRefresh(RouteFamily),
            MessageError(MessageError),
        }

        #[derive(Debug)]
        pub enum TimerMsg {
            LlgrExpired { addr: IpAddr, family: RouteFamily },
            RtcDeferralExpired(IpAddr),
            SelectionDeferralExpired,
        }

        impl FsmMsg {
            pub(crate) fn new(
                addr: IpAddr,
                version: u64,
                event: FsmEvent,
            ) -> FsmMsg {
                FsmMsg {
                    addr,
                    version,
                    timestamp: Utc::now(),
                    event,
                }
            }
        }
    }

    // Output messages (main task -> child task).
    pub mod output {
        use bgpd_utils::{UnboundedReceiver, UnboundedSender};

        use super::*;

        // One propagation batch for an established session. The paths are
        // always written before the End-of-RIB markers and the optional
        // NOTIFICATION.
        #[derive(Debug, Default)]
        pub struct Outgoing {
            pub paths: Vec<Path>,
            pub eor: Vec<RouteFamily>,
            pub notification: Option<NotificationMsg>,
            // Keeps the peer down once the NOTIFICATION is sent.
            pub stay_idle: bool,
        }

        // Allows the FSM to leave the state it just reported.
        #[derive(Debug, Default)]
        pub struct Resume {
            // Outgoing queue of a new established session.
            pub outgoing: Option<(
                UnboundedSender<Outgoing>,
                UnboundedReceiver<Outgoing>,
            )>,
        }

        impl Outgoing {
            pub(crate) fn paths(paths: Vec<Path>) -> Outgoing {
                Outgoing {
                    paths,
                    ..Default::default()
                }
            }

            pub(crate) fn notification(msg: NotificationMsg) -> Outgoing {
                Outgoing {
                    notification: Some(msg),
                    ..Default::default()
                }
            }

            pub(crate) fn is_empty(&self) -> bool {
                self.paths.is_empty()
                    && self.eor.is_empty()
                    && self.notification.is_none()
            }
        }
    }
}

// ===== BGP tasks =====

// TCP listening task.
pub(crate) fn tcp_listener(
    listener: &Arc<TcpListener>,
    token: &CancellationToken,
    tcp_acceptp: &Sender<Connection>,
) -> Task<Option<()>> {
    let span1 = debug_span!("session");
    let _span1_guard = span1.enter();
    let span2 = debug_span!("input");
    let _span2_guard = span2.enter();

    let listener = listener.clone();
    let tcp_acceptp = tcp_acceptp.clone();
    Task::spawn_cancellable(
        token.clone(),
        async move {
            let _ = network::listen_loop(listener, tcp_acceptp).await;
        }
        .in_current_span(),
    )
}

// TCP connect task.
pub(crate) fn tcp_connect(
    fsm: &Fsm,
    conn_tx: &Sender<Connection>,
) -> Task<()> {
    let span = debug_span!("neighbor", addr = %fsm.addr);
    let _span_guard = span.enter();

    let remote_addr =
        SocketAddr::from((fsm.addr, fsm.config.transport.remote_port));
    let local_addr = fsm.config.transport.local_address;
    let ttl = fsm.tx_ttl();
    let min_ttl = fsm.min_ttl();
    let password = fsm.config.auth_password.clone();
    let retry =
        std::cmp::max(fsm.config.timers.connect_retry, MIN_CONNECT_RETRY);
    let retry = u64::from(retry) * 1000;
    let conn_tx = conn_tx.clone();
    Task::spawn(
        async move {
            loop {
                // Randomize the retry interval to desynchronize both ends.
                let delay = rand::rng().random_range(retry..retry * 2);
                sleep(Duration::from_millis(delay)).await;

                let result = network::connect(
                    remote_addr,
                    local_addr,
                    ttl,
                    min_ttl,
                    password.as_deref(),
                )
                .await;
                match result {
                    Ok(conn) => {
                        let _ = conn_tx.send(conn).await;
                        return;
                    }
                    Err(error) => {
                        error.log();
                    }
                }
            }
        }
        .in_current_span(),
    )
}

// Peer FSM task.
pub(crate) fn peer_fsm(handler: FsmHandler) -> Task<()> {
    let span = debug_span!("neighbor", addr = %handler.addr);
    let _span_guard = span.enter();

    Task::spawn(
        async move {
            handler.run().await;
        }
        .in_current_span(),
    )
}

// Neighbor Rx task.
pub(crate) fn nbr_rx(
    cxt: &SessionCxt,
    reader: FramedRead<ReadHalf<Stream>, MessageDecoder>,
    hold_resetp: mpsc::Sender<()>,
) -> Task<()> {
    let span1 = debug_span!("neighbor", addr = %cxt.addr);
    let _span1_guard = span1.enter();
    let span2 = debug_span!("input");
    let _span2_guard = span2.enter();

    let cxt = cxt.clone();

    // Spawn a supervised task for this neighbor.
    //
    // The read loop runs inside an inner task so that a panic caused by a
    // malformed message is reported as a read failure instead of leaving the
    // session without a reader.
    Task::spawn(
        async move {
            let worker_task = {
                let cxt = cxt.clone();
                Task::spawn(
                    async move {
                        handler::nbr_read_loop(cxt, reader, hold_resetp).await;
                    }
                    .in_current_span(),
                )
            };
            if let Err(error) = worker_task.await
                && error.is_panic()
            {
                error!(%error, "task panicked");
                let _ = cxt.reason_tx.send(StateReason::ReadFailed).await;
            }
        }
        .in_current_span(),
    )
}

// Neighbor Tx task.
pub(crate) fn nbr_tx(
    cxt: &SessionCxt,
    writer: MessageWriter,
    outgoing_rx: UnboundedReceiver<Outgoing>,
) -> Task<()> {
    let span1 = debug_span!("neighbor", addr = %cxt.addr);
    let _span1_guard = span1.enter();
    let span2 = debug_span!("output");
    let _span2_guard = span2.enter();

    let cxt = cxt.clone();
    Task::spawn(
        async move {
            handler::nbr_write_loop(cxt, writer, outgoing_rx).await;
        }
        .in_current_span(),
    )
}

// LLGR stale timer of one address family.
pub(crate) fn llgr_timer(
    addr: IpAddr,
    family: RouteFamily,
    seconds: u32,
    timerp: &Sender<TimerMsg>,
) -> TimeoutTask {
    let timerp = timerp.clone();
    TimeoutTask::new(Duration::from_secs(seconds.into()), move || async move {
        let msg = TimerMsg::LlgrExpired { addr, family };
        let _ = timerp.send(msg).await;
    })
}

// Route selection or RTC deferral timer.
pub(crate) fn deferral_timer(
    msg: TimerMsg,
    seconds: u16,
    timerp: &Sender<TimerMsg>,
) -> TimeoutTask {
    let timerp = timerp.clone();
    TimeoutTask::new(Duration::from_secs(seconds.into()), move || async move {
        let _ = timerp.send(msg).await;
    })
}
