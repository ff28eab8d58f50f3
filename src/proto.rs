//! Wire shapes for the client <-> librarian protocol and the conversion
//! from engine results to replies.
//!
//! Requests are JSON objects tagged by `command` and carrying a per-call
//! `context`; replies are `{value, errmsg, errno, context}` with the context
//! echoed back.  Out-of-band messages travel beside the reply in their own
//! envelope.  Socket framing lives with the transport, not here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::LibrarianEngine;
use crate::error::{internal, EngineError};
use crate::store::MetadataStore;

/// Caller identity attached to every command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub node_id: u32,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    #[serde(default)]
    pub umask: u32,
}

/// The command set.  The serde tag doubles as the registry: one variant per
/// wire tag, fixed at compile time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Version,
    GetFsStats,
    CreateShelf {
        name: String,
    },
    GetShelf {
        name: String,
        #[serde(default)]
        match_id: Option<u64>,
    },
    ListShelves,
    OpenShelf {
        name: String,
    },
    CloseShelf {
        handle: u64,
    },
    DestroyShelf {
        name: String,
    },
    ResizeShelf {
        name: String,
        #[serde(default)]
        match_id: Option<u64>,
        size_bytes: u64,
    },
    GetXattr {
        name: String,
        xattr: String,
    },
    ListXattrs {
        name: String,
    },
    SetXattr {
        name: String,
        xattr: String,
        value: String,
    },
    RemoveXattr {
        name: String,
        xattr: String,
    },
    SetAmTime {
        name: String,
        mtime: u64,
    },
    KillZombieBooks,
    LogZero {
        book_ids: Vec<u64>,
    },
    #[serde(rename = "send_OOB")]
    SendOob {
        msg: String,
    },
    ListBook {
        book_id: u64,
    },
    ListBos {
        shelf_id: u64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    #[serde(flatten)]
    pub command: Command,
    pub context: Context,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reply {
    pub value: Value,
    pub errmsg: String,
    pub errno: i32,
    pub context: Context,
}

/// Out-of-band notification, delivered beside the reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OobEnvelope {
    #[serde(rename = "OOBmsg")]
    pub msg: String,
}

fn jsonify<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| internal!("reply serialization: {e}"))
}

impl<S: MetadataStore> LibrarianEngine<S> {
    /// Run one wire request.  Failures become `{errmsg, errno}` replies; the
    /// caller's context is always echoed.
    pub fn dispatch(&mut self, request: &Request) -> (Reply, Option<OobEnvelope>) {
        let ctx = &request.context;
        let mut oob = None;
        let result = match &request.command {
            Command::Version => Ok(Value::String(self.version().to_string())),
            Command::GetFsStats => self.get_fs_stats().and_then(jsonify),
            Command::CreateShelf { name } => self.create_shelf(ctx, name).and_then(jsonify),
            Command::GetShelf { name, match_id } => {
                self.get_shelf(name, *match_id).and_then(jsonify)
            }
            Command::ListShelves => self.list_shelves().and_then(jsonify),
            Command::OpenShelf { name } => self.open_shelf(ctx, name).and_then(jsonify),
            Command::CloseShelf { handle } => self.close_shelf(ctx, *handle).and_then(jsonify),
            Command::DestroyShelf { name } => self.destroy_shelf(ctx, name).and_then(jsonify),
            Command::ResizeShelf {
                name,
                match_id,
                size_bytes,
            } => self
                .resize_shelf(ctx, name, *match_id, *size_bytes)
                .and_then(jsonify),
            Command::GetXattr { name, xattr } => self.get_xattr(name, xattr).and_then(jsonify),
            Command::ListXattrs { name } => self.list_xattrs(name).and_then(jsonify),
            Command::SetXattr { name, xattr, value } => {
                self.set_xattr(name, xattr, value).map(|()| Value::Null)
            }
            Command::RemoveXattr { name, xattr } => {
                self.remove_xattr(name, xattr).map(|()| Value::Null)
            }
            Command::SetAmTime { name, mtime } => {
                self.set_am_time(name, *mtime).and_then(jsonify)
            }
            Command::KillZombieBooks => self.kill_zombie_books(ctx).and_then(jsonify),
            Command::LogZero { book_ids } => self.log_zero(ctx, book_ids).and_then(jsonify),
            Command::SendOob { msg } => {
                oob = Some(OobEnvelope {
                    msg: self.send_oob(msg),
                });
                Ok(Value::Null)
            }
            Command::ListBook { book_id } => self.list_book(*book_id).and_then(jsonify),
            Command::ListBos { shelf_id } => self.list_bos(*shelf_id).and_then(jsonify),
        };
        let reply = match result {
            Ok(value) => Reply {
                value,
                errmsg: String::new(),
                errno: 0,
                context: ctx.clone(),
            },
            Err(e) => Reply {
                value: Value::Null,
                errmsg: e.to_string(),
                errno: e.errno(),
                context: ctx.clone(),
            },
        };
        (reply, oob)
    }
}
