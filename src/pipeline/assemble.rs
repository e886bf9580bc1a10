//! Per-request pipeline assembly.
//!
//! Builds the send chain `[handler, filters.., connector]` and, when
//! the request declares a body, the receive chain
//! `[connector, input filters.., handler]`. Queues of the same stage in
//! both directions are cross-referenced as pairs so flow-control
//! signals can cross direction.

use crate::host::{extension_ok, Host};
use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::pipeline::queue::Direction;
use crate::pipeline::stage::Stage;
use crate::pipeline::Tx;
use std::sync::Arc;
use tracing::trace;

/// Build the full queue network for a request.
///
/// `secure` disqualifies the sendfile path (it cannot encrypt
/// in-kernel). Handler selection failures still produce a working
/// pipeline: the error is recorded on the transaction and raised once
/// the queues are open.
pub fn build(host: &Host, req: Request, secure: bool) -> Tx {
    let mut resp = Response::new();
    if req.method == Method::Head {
        resp.suppress_body = true;
    }

    let (handler, pending_error) = match host.select_handler(&req) {
        Ok(h) => (h, None),
        Err(status) => (host.fallback_handler(), Some(status)),
    };

    let sendfile = handler.name() == "file" && req.range.is_none() && !secure;
    let connector = if sendfile {
        host.send_connector()
    } else {
        host.net_connector()
    };
    resp.uses_sendfile = sendfile;

    let mut tx = Tx::new(req, resp);
    tx.pending_error = pending_error;
    let max = host.limits.queue_max;
    let psize = host.limits.packet_size;

    let mut send_ids = Vec::new();
    send_ids.push(tx.net.add(handler.clone(), Direction::Send, max, psize));
    for filter in host.filters() {
        if applicable(filter.as_ref(), &tx.req) {
            send_ids.push(tx.net.add(filter.clone(), Direction::Send, max, psize));
        }
    }
    send_ids.push(tx.net.add(connector.clone(), Direction::Send, max, psize));
    tx.net.link(&send_ids);
    tx.net.send_head = send_ids[0];
    tx.net.connector = *send_ids.last().expect("send chain is never empty");

    if tx.req.has_body() {
        let mut recv_ids = Vec::new();
        recv_ids.push(tx.net.add(connector.clone(), Direction::Receive, max, psize));
        for filter in host.filters() {
            if filter.incoming() && applicable(filter.as_ref(), &tx.req) {
                recv_ids.push(tx.net.add(filter.clone(), Direction::Receive, max, psize));
            }
        }
        recv_ids.push(tx.net.add(handler.clone(), Direction::Receive, max, psize));
        tx.net.link(&recv_ids);
        tx.net.recv_head = Some(recv_ids[0]);
        tx.net.recv_handler = Some(*recv_ids.last().expect("receive chain is never empty"));

        pair_shared_stages(&mut tx, &send_ids, &recv_ids);
    }

    trace!(
        handler = handler.name(),
        stages = tx.net.len(),
        sendfile,
        "pipeline assembled"
    );
    tx
}

/// A filter applies when its method mask covers the request method,
/// its extension list (if any) matches, and its predicate accepts.
fn applicable(stage: &dyn Stage, req: &Request) -> bool {
    stage.methods() & req.method.mask() != 0
        && extension_ok(stage, req)
        && stage.matches(req)
}

/// Cross-reference queues belonging to the same stage template in
/// opposite directions.
fn pair_shared_stages(tx: &mut Tx, send_ids: &[usize], recv_ids: &[usize]) {
    for &s in send_ids {
        for &r in recv_ids {
            let same = Arc::ptr_eq(&tx.net.queue(s).stage, &tx.net.queue(r).stage);
            if same && tx.net.queue(s).pair.is_none() && tx.net.queue(r).pair.is_none() {
                tx.net.queue_mut(s).pair = Some(r);
                tx.net.queue_mut(r).pair = Some(s);
            }
        }
    }
}
