pub mod backend;
pub mod cluster;
pub mod credentials;
pub mod event_watcher;
#[cfg(test)]
pub mod fake;
pub mod leader_election;
pub mod metrics;
pub mod predicates;
pub mod reconciler;
pub mod retention;
pub mod throttle;
pub mod work_queue;
