use anyhow::{Result, bail};
use serde_json::json;
use tabled::{Table, Tabled, settings::Style};

use nestling_core::models::{
    EntityType, MutationPayload, Operation, new_entry_id, validate_mutation,
};
use nestling_core::queue::MutationQueue;

use super::helpers::{fill_default_time, parse_fields, truncate};

pub(crate) fn cmd_queue_add(
    queue: &MutationQueue,
    entity: &str,
    op: &str,
    target: Option<String>,
    fields: &[String],
    json: bool,
) -> Result<()> {
    let entity: EntityType = entity.parse()?;
    let op: Operation = op.parse()?;
    let mut fields = parse_fields(fields)?;
    let mut target_id = target;
    if op == Operation::Create {
        fill_default_time(entity, &mut fields);
        target_id.get_or_insert_with(new_entry_id);
    }

    let payload = MutationPayload {
        entity,
        op,
        target_id,
        fields,
    };
    // Catch obvious mistakes now rather than after the item has been synced.
    validate_mutation(&payload)?;

    let item = queue.enqueue(payload)?;
    let pending = queue.count()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
    } else {
        println!(
            "Queued {} {} ({}); {pending} pending",
            item.payload.op, item.payload.entity, item.id
        );
        if let (Operation::Create, Some(entry_id)) = (item.payload.op, &item.payload.target_id) {
            println!("Entry id: {entry_id}");
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct QueueRow {
    #[tabled(rename = "#")]
    idx: usize,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Queued")]
    created_at: String,
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Op")]
    op: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Fields")]
    fields: String,
}

pub(crate) fn cmd_queue_list(queue: &MutationQueue, json: bool) -> Result<()> {
    let items = queue.list_all()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    let rows: Vec<QueueRow> = items
        .iter()
        .enumerate()
        .map(|(i, item)| QueueRow {
            idx: i + 1,
            id: item.id.clone(),
            created_at: item.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            entity: item.payload.entity.to_string(),
            op: item.payload.op.to_string(),
            target: item.payload.target_id.clone().unwrap_or_else(|| "-".into()),
            fields: truncate(&serde_json::Value::Object(item.payload.fields.clone()).to_string(), 50),
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) fn cmd_queue_count(queue: &MutationQueue, json: bool) -> Result<()> {
    let pending = queue.count()?;
    let dropped = queue.dropped()?.len();
    if json {
        println!("{}", json!({ "pending": pending, "dropped": dropped }));
    } else {
        println!("{pending} pending, {dropped} dropped");
    }
    Ok(())
}

pub(crate) fn cmd_queue_discard(queue: &MutationQueue, id: &str, json: bool) -> Result<()> {
    if !queue.discard(id)? {
        bail!("No queued mutation with id '{id}'");
    }
    if json {
        println!("{}", json!({ "discarded": id }));
    } else {
        println!("Discarded {id}");
    }
    Ok(())
}

#[derive(Tabled)]
struct DroppedRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Dropped")]
    dropped_at: String,
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Op")]
    op: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Message")]
    message: String,
}

pub(crate) fn cmd_queue_dropped(queue: &MutationQueue, json: bool) -> Result<()> {
    let dropped = queue.dropped()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&dropped)?);
        return Ok(());
    }
    if dropped.is_empty() {
        println!("No dropped mutations.");
        return Ok(());
    }

    let rows: Vec<DroppedRow> = dropped
        .iter()
        .map(|d| DroppedRow {
            id: d.mutation.id.clone(),
            dropped_at: d.dropped_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            entity: d.mutation.payload.entity.to_string(),
            op: d.mutation.payload.op.to_string(),
            reason: d.reason.to_string(),
            message: truncate(&d.message, 50),
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}
