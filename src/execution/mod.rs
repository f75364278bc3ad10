//! Transactional execution: the observer chain and the executor that runs
//! units of work inside store transactions.

mod executor;
mod observer;

pub use executor::{TransactionExecutor, TransactionInfo, TransactionScope};
pub use observer::{
    Next, ObserverChain, ObserverContext, TracingObserver, TransactionObserver, TypeTagObserver,
};
