mod admin;
mod growth;
mod helpers;
mod queue;
mod sync;

pub(crate) use admin::{
    cmd_admin_add_baby, cmd_admin_add_caller, cmd_admin_list, cmd_admin_share, cmd_admin_use,
};
pub(crate) use growth::{cmd_growth_curve, cmd_growth_percentile};
pub(crate) use queue::{
    cmd_queue_add, cmd_queue_count, cmd_queue_discard, cmd_queue_dropped, cmd_queue_list,
};
pub(crate) use sync::{SyncOptions, cmd_sync};
