//! Functions exposed to the model

mod execute;

pub use execute::{
    AutoApprove, CommandApproval, EXECUTE_COMMAND, ExecuteCommand, definition as execute_command,
};
