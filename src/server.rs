use std::io;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::protocol::{
    self, ClearReply, ClearRequest, ContextRequest, ErrorReply, GetRequest, PurgeRequest,
    QueryRequest, StatsRequest, StoreReply, StoreRequest, OP_CLEAR, OP_COMPACT, OP_CONTEXT,
    OP_GET, OP_PURGE, OP_QUERY, OP_STATS, OP_STORE, STATUS_ERR, STATUS_OK,
};
use crate::RecallDb;

type Reply = (u8, Vec<u8>);

pub struct RecallServer {
    db: Arc<RecallDb>,
}

impl RecallServer {
    pub fn new(db: Arc<RecallDb>) -> Self {
        Self { db }
    }

    pub async fn run(&self, addr: &str) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "recall listening");
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let db = self.db.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(socket, db).await {
                            // Ignore expected disconnections to keep logs clean
                            if e.kind() != io::ErrorKind::UnexpectedEof {
                                warn!(%peer, error = %e, "client error");
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "connection failed"),
            }
        }
    }
}

async fn handle_client(mut stream: TcpStream, db: Arc<RecallDb>) -> io::Result<()> {
    loop {
        let Some((op_code, body)) = protocol::read_frame(&mut stream).await? else {
            return Ok(());
        };

        let (status, payload) = match op_code {
            OP_STORE => {
                call(&db, &body, |db: &RecallDb, req: StoreRequest| {
                    db.store(req.collection, req.id.as_deref(), &req.document, req.metadata)
                        .map(|id| StoreReply { id })
                })
                .await
            }
            OP_QUERY => {
                call(&db, &body, |db: &RecallDb, req: QueryRequest| {
                    db.query_similar(req.collection, &req.text, &req.scope, req.n_results)
                })
                .await
            }
            OP_CONTEXT => {
                call(&db, &body, |db: &RecallDb, req: ContextRequest| {
                    db.get_context(&req.user_id, &req.project_id, &req.code, req.review_type)
                })
                .await
            }
            OP_STATS => {
                call(&db, &body, |db: &RecallDb, req: StatsRequest| db.stats(req.scope.as_ref())).await
            }
            OP_PURGE => {
                call(&db, &body, |db: &RecallDb, req: PurgeRequest| db.purge(&req.user_id)).await
            }
            OP_GET => {
                call(&db, &body, |db: &RecallDb, req: GetRequest| db.get(req.collection, &req.id)).await
            }
            OP_COMPACT => {
                call(&db, &body, |db: &RecallDb, _: serde_json::Value| db.compact()).await
            }
            OP_CLEAR => {
                call(&db, &body, |db: &RecallDb, req: ClearRequest| {
                    db.clear(req.collection).map(|removed| ClearReply { removed })
                })
                .await
            }
            _ => {
                warn!(op_code, "unknown opcode");
                error_reply(&ErrorReply::new("protocol", format!("unknown opcode 0x{op_code:02X}")))
            }
        };

        let mut writer = BufWriter::new(&mut stream);
        protocol::write_frame(&mut writer, status, &payload).await?;
        writer.flush().await?;
    }
}

/// Decodes the request, runs `f` on the blocking pool and encodes the outcome.
async fn call<Req, Resp, F>(db: &Arc<RecallDb>, body: &[u8], f: F) -> Reply
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: FnOnce(&RecallDb, Req) -> crate::error::Result<Resp> + Send + 'static,
{
    let request: Req = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return error_reply(&ErrorReply::new("bad_request", e.to_string())),
    };

    let db = db.clone();
    match tokio::task::spawn_blocking(move || f(db.as_ref(), request)).await {
        Ok(Ok(response)) => match serde_json::to_vec(&response) {
            Ok(bytes) => (STATUS_OK, bytes),
            Err(e) => error_reply(&ErrorReply::new("internal", e.to_string())),
        },
        Ok(Err(e)) => {
            debug!(kind = e.kind(), error = %e, "request failed");
            error_reply(&ErrorReply::from(&e))
        }
        Err(e) => {
            warn!(error = %e, "engine task aborted");
            error_reply(&ErrorReply::new("internal", e.to_string()))
        }
    }
}

fn error_reply(reply: &ErrorReply) -> Reply {
    let body = serde_json::to_vec(reply).unwrap_or_else(|_| br#"{"kind":"internal","message":""}"#.to_vec());
    (STATUS_ERR, body)
}
