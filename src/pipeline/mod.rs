//! Message routing pipeline.
//!
//! Every inbound message flows through four stages sharing one correlation id:
//! 1. `MessageIngestor::ingest()`: contact normalization, conversation upsert
//! 2. `StateEvaluator::evaluate()`: pure decision (menu, handoff, courtesy...)
//! 3. `ActionExecutor::execute()`: reply text and persistence instructions
//! 4. `ResponsePersistor::persist()`: handoff saga, logs, outbound send
//!
//! `RouterPipeline` composes them and is the "new" routing implementation
//! the migration layer dispatches to.

pub mod area;
pub mod evaluator;
pub mod executor;
pub mod ingest;
pub mod persistor;
pub mod processor;
pub mod saga;
pub mod types;

pub use processor::RouterPipeline;
