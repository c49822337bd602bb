//! Control socket: the operator surface over a Unix domain
//! socket, one JSON command per line in, one JSON result out. Accepting
//! connections runs on its own thread; every command is forwarded to the
//! runtime's single cooperative loop over a channel, so no state here is
//! ever touched from two threads at once.
use std::io::prelude::*;
use std::io::{BufReader, LineWriter};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use crossbeam_channel as chan;
use serde::{Deserialize, Serialize};
use serde_json as json;

use shelfos::codec::Value;
use shelfos::discovery::{PeerRecord, RemotePeripheral};
use shelfos::identity::NodeId;
use shelfos::scheduler::Activity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    CreateSwarm {
        name: String,
    },
    PairAsQueen {
        #[serde(rename = "peerID")]
        peer_id: NodeId,
        label: Option<String>,
        code: String,
    },
    PairAsWorker,
    Revoke {
        #[serde(rename = "peerID")]
        peer_id: NodeId,
    },
    Remove {
        #[serde(rename = "peerID")]
        peer_id: NodeId,
    },
    ListPeers,
    ListRemotePeripherals,
    DiscoverOnce {
        timeout_ms: i64,
    },
    Call {
        peripheral_name: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "camelCase")]
pub enum CommandResult {
    Okay,
    Peers(Vec<(NodeId, PeerRecord)>),
    RemotePeripherals(Vec<(String, RemotePeripheral)>),
    Discovered {
        peers: Vec<(NodeId, PeerRecord)>,
        remote_peripherals: Vec<(String, RemotePeripheral)>,
    },
    CallResult(Vec<Value>),
    Status(Activity),
    Error(String),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind control socket at {0}: {1}")]
    Bind(std::path::PathBuf, std::io::Error),
}

/// Accept connections on `socket_path` forever, forwarding each parsed
/// command to the runtime over `dispatch` and writing back its result.
pub fn listen(
    socket_path: &Path,
    dispatch: chan::Sender<(Command, chan::Sender<CommandResult>)>,
) -> Result<(), Error> {
    std::fs::remove_file(socket_path).ok();
    let listener = UnixListener::bind(socket_path)
        .map_err(|e| Error::Bind(socket_path.to_path_buf(), e))?;

    log::debug!(target: "control", "Listening on {}", socket_path.display());

    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                if let Err(e) = handle_connection(stream, &dispatch) {
                    log::error!(target: "control", "Connection error: {e}");
                }
            }
            Err(e) => log::error!(target: "control", "Failed to accept connection: {e}"),
        }
    }
    Ok(())
}

fn handle_connection(
    stream: UnixStream,
    dispatch: &chan::Sender<(Command, chan::Sender<CommandResult>)>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(&stream);
    let mut writer = LineWriter::new(&stream);
    let mut line = String::new();

    reader.read_line(&mut line)?;
    let input = line.trim_end();
    log::debug!(target: "control", "Received `{input}`");

    let result = match json::from_str::<Command>(input) {
        Ok(command) => {
            let (tx, rx) = chan::bounded(1);
            if dispatch.send((command, tx)).is_err() {
                CommandResult::Error("runtime loop is gone".into())
            } else {
                rx.recv().unwrap_or(CommandResult::Error("runtime loop dropped the reply channel".into()))
            }
        }
        Err(e) => CommandResult::Error(format!("malformed command: {e}")),
    };

    let body = json::to_string(&result)?;
    writeln!(writer, "{body}")?;
    writer.flush()
}
