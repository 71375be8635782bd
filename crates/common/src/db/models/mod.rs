//! SeaORM entity models
//!
//! Database entities for debugtap

mod captured_record;
mod debug_session;

pub use debug_session::{
    Entity as DebugSessionEntity,
    Model as DebugSession,
    ActiveModel as DebugSessionActiveModel,
    Column as DebugSessionColumn,
};

pub use captured_record::{
    Entity as CapturedRecordEntity,
    Model as CapturedRecord,
    ActiveModel as CapturedRecordActiveModel,
    Column as CapturedRecordColumn,
    StatusClass,
    format_bytes,
};
