mod core;
mod event;
mod handler;
mod options;

pub use self::core::MasterActor;
pub use event::MasterEvent;
pub use options::MasterOptions;

use keel_server::actor::ActorHandle;

pub type MasterHandle = ActorHandle<MasterActor>;
