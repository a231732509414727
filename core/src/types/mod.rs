pub mod block;
pub mod checkpoint;
pub mod core;

pub use block::{
    Block, BlockStatus, CallKind, DeclareTransaction, DeployAccountTransaction, DeployTransaction,
    ExecutionResources, ExecutionStatus, FeePayment, FeeUnit, InvokeTransaction, L1DaMode,
    L1HandlerTransaction, LightBlock, Log, MessageToL1, ReceiptEvent, ResourceBounds,
    ResourceBoundsMapping, ResourcePrice, Trace, Transaction, TransactionReceipt,
};
pub use checkpoint::{Checkpoint, EventKind};
pub use core::{BlockNumber, ChainId};
