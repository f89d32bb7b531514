pub mod model;
pub mod server;

pub use model::{
    ChannelRequest, CloseRequest, CloseResponse, CommitmentResponse, ForwardRequest, Named,
    OpenRequest, OpenResponse, PayRequest, UpdateRequest,
};
pub use server::{build_rpc_module, start_rpc_server, RpcMethods, RpcServer};
