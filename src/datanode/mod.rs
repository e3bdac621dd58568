//! A data node: the durable back end of the chatroom service. Each node
//! holds a full replica of user credentials, chatroom ownership, and chat
//! logs, exposes a read surface for the coordinator's gates, and acts as a
//! two-phase commit participant for all writes.

pub mod participant;
pub mod store;

use crate::errdata;
use crate::error::Result;
use crate::message::{
    Address, DataRequest, DataResponse, ParticipantRequest, ParticipantResponse, RegisterResponse,
    RegistryRequest, RegistryResponse,
};
use crate::rpc;
use participant::Participant;
use store::Store;

use log::info;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

pub struct DataNode {
    host: String,
    coordinator: Address,
    store: Arc<Store>,
}

impl DataNode {
    /// Creates a data node, opening (and replaying) its durable store under
    /// `<data_dir>/files_<id>/`.
    pub fn new(id: &str, host: &str, data_dir: &Path, coordinator: Address) -> Result<Self> {
        let store = Arc::new(Store::open(data_dir.join(format!("files_{id}")))?);
        Ok(Self { host: host.into(), coordinator, store })
    }

    /// Registers with the coordinator and serves the read and participant
    /// surfaces until the process exits. The registration reports the
    /// chatrooms replayed from disk so the coordinator can re-place them,
    /// and returns the coordinator's decision port for the participant's
    /// callbacks.
    pub fn serve(self, ops_listener: TcpListener, participant_listener: TcpListener) -> Result<()> {
        let ops_port = ops_listener.local_addr()?.port();
        let participant_port = participant_listener.local_addr()?.port();

        let chatrooms = self.store.chatroom_names()?;
        let request = RegistryRequest::RegisterDataNode {
            host: self.host.clone(),
            ops_port,
            participant_port,
            chatrooms,
        };
        let RegistryResponse::Register(RegisterResponse { port: decision_port }) =
            rpc::call(&self.coordinator, &request)?
        else {
            return errdata!("unexpected registration response");
        };
        info!(
            "Registered data node {}:{ops_port} with coordinator {}, decision port {decision_port}",
            self.host, self.coordinator
        );
        rpc::log_clock_offset(&self.coordinator);

        let decision = Address::new(self.coordinator.host.clone(), decision_port);
        let participant = Arc::new(ParticipantService {
            participant: Participant::new(self.store.clone(), decision),
        });
        let ops = Arc::new(DataOpsService { store: self.store });

        std::thread::scope(|scope| {
            scope.spawn(|| rpc::serve(ops_listener, ops));
            rpc::serve(participant_listener, participant)
        })
    }
}

/// The coordinator-facing read surface: existence and verification gates.
struct DataOpsService {
    store: Arc<Store>,
}

impl rpc::Service for DataOpsService {
    type Request = DataRequest;
    type Response = DataResponse;

    fn handle(&self, request: DataRequest) -> Result<DataResponse> {
        Ok(match request {
            DataRequest::VerifyUser { username, password } => {
                DataResponse::Status(self.store.verify_user(&username, &password)?)
            }
            DataRequest::VerifyOwnership { chatroom, username } => {
                DataResponse::Status(self.store.verify_ownership(&chatroom, &username)?)
            }
            DataRequest::UserExists { username } => {
                DataResponse::Exists(self.store.user_exists(&username)?)
            }
            DataRequest::ChatroomExists { chatroom } => {
                DataResponse::Exists(self.store.chatroom_exists(&chatroom)?)
            }
        })
    }
}

/// The coordinator-facing two-phase commit surface.
struct ParticipantService {
    participant: Participant,
}

impl rpc::Service for ParticipantService {
    type Request = ParticipantRequest;
    type Response = ParticipantResponse;

    fn handle(&self, request: ParticipantRequest) -> Result<ParticipantResponse> {
        Ok(match request {
            ParticipantRequest::CanCommit { transaction, participant } => {
                ParticipantResponse::Vote(self.participant.can_commit(transaction, participant)?)
            }
            ParticipantRequest::DoCommit { transaction, participant } => {
                self.participant.do_commit(&transaction, &participant)?;
                ParticipantResponse::Done
            }
            ParticipantRequest::DoAbort { transaction } => {
                self.participant.do_abort(&transaction)?;
                ParticipantResponse::Done
            }
        })
    }
}
