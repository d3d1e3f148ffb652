//! Task-routing gateway: maps each analysis task to one inference model and
//! forwards requests to an OpenAI-compatible provider with bounded retries.

mod env;
mod error;
pub mod gateway;
pub mod logging;
pub mod utils;

pub use env::{Env, parse_dotenv};
pub use error::{Result, TaskRouteError};
pub use gateway::{
    AnalysisRequest, AnalysisResult, Dispatcher, GatewayConfig, GatewayError, RouteTable,
    TaskKind, UpstreamCredential,
};
