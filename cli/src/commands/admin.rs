use anyhow::{Context, Result, bail};
use serde_json::json;
use tabled::{Table, Tabled, settings::Style};

use nestling_core::db::Database;
use nestling_core::growth::Sex;
use nestling_core::models::{Caller, CaregiverRole};

use super::helpers::parse_date;
use crate::config::{Config, generate_token};

/// Find a caller by id, falling back to a unique name match.
fn resolve_caller(db: &Database, reference: &str) -> Result<Caller> {
    if let Ok(caller) = db.get_caller(reference) {
        return Ok(caller);
    }
    let mut matches: Vec<Caller> = db
        .list_callers()?
        .into_iter()
        .filter(|c| c.name.eq_ignore_ascii_case(reference))
        .collect();
    match matches.len() {
        0 => bail!("No caller with id or name '{reference}'"),
        1 => Ok(matches.remove(0)),
        n => bail!("{n} callers are named '{reference}'; use the caller id"),
    }
}

pub(crate) fn cmd_admin_add_caller(
    db: &Database,
    config: &Config,
    name: &str,
    save: bool,
    json: bool,
) -> Result<()> {
    let token = generate_token();
    let caller = db.create_caller(name, &token)?;
    let saved = if save {
        Some(config.save_token(&token)?)
    } else {
        None
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "caller": caller,
                "token": token,
                "saved_to": saved,
            }))?
        );
    } else {
        println!("Added caller {} ({})", caller.name, caller.id);
        println!("Token (shown once): {token}");
        if let Some(path) = saved {
            println!("Saved to {}", path.display());
        }
    }
    Ok(())
}

pub(crate) fn cmd_admin_add_baby(
    db: &Database,
    owner: &str,
    name: &str,
    birth_date: Option<String>,
    sex: Option<&str>,
    json: bool,
) -> Result<()> {
    let owner = resolve_caller(db, owner)?;
    let birth_date = birth_date.map(|d| parse_date(Some(d))).transpose()?;
    let sex = sex.map(str::parse::<Sex>).transpose()?;

    let baby = db.create_baby(&owner.id, name, birth_date, sex.map(Sex::as_str))?;
    // A caller's first baby becomes their active one.
    if owner.active_baby_id.is_none() {
        db.set_active_baby(&owner.id, &baby.id)?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&baby)?);
    } else {
        println!("Added {} ({}) owned by {}", baby.name, baby.id, owner.name);
    }
    Ok(())
}

pub(crate) fn cmd_admin_share(
    db: &Database,
    caller: &str,
    baby_id: &str,
    role: &str,
    json: bool,
) -> Result<()> {
    let caller = resolve_caller(db, caller)?;
    let role: CaregiverRole = role.parse()?;
    db.link_caregiver(&caller.id, baby_id, role)?;
    let baby = db
        .get_baby(baby_id)?
        .with_context(|| format!("Baby not found: {baby_id}"))?;

    if json {
        println!(
            "{}",
            json!({ "caller_id": caller.id, "baby_id": baby.id, "role": role })
        );
    } else {
        println!("{} is now {} of {}", caller.name, role.as_str(), baby.name);
    }
    Ok(())
}

pub(crate) fn cmd_admin_use(db: &Database, caller: &str, baby_id: &str, json: bool) -> Result<()> {
    let caller = resolve_caller(db, caller)?;
    db.set_active_baby(&caller.id, baby_id)?;
    if json {
        println!("{}", json!({ "caller_id": caller.id, "active_baby_id": baby_id }));
    } else {
        println!("{} now logs for baby {baby_id} by default", caller.name);
    }
    Ok(())
}

#[derive(Tabled)]
struct AccessRow {
    #[tabled(rename = "Caller")]
    caller: String,
    #[tabled(rename = "Caller ID")]
    caller_id: String,
    #[tabled(rename = "Baby")]
    baby: String,
    #[tabled(rename = "Baby ID")]
    baby_id: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Active")]
    active: String,
}

pub(crate) fn cmd_admin_list(db: &Database, json: bool) -> Result<()> {
    let callers = db.list_callers()?;

    let mut rows = Vec::new();
    let mut listing = Vec::new();
    for caller in &callers {
        let babies = db.linked_babies(&caller.id)?;
        if babies.is_empty() {
            rows.push(AccessRow {
                caller: caller.name.clone(),
                caller_id: caller.id.clone(),
                baby: "-".into(),
                baby_id: "-".into(),
                role: "-".into(),
                active: String::new(),
            });
        }
        for (baby, role) in &babies {
            let active = caller.active_baby_id.as_deref() == Some(baby.id.as_str());
            rows.push(AccessRow {
                caller: caller.name.clone(),
                caller_id: caller.id.clone(),
                baby: baby.name.clone(),
                baby_id: baby.id.clone(),
                role: role.as_str().to_string(),
                active: if active { "*".into() } else { String::new() },
            });
        }
        listing.push(json!({
            "caller": caller,
            "babies": babies
                .iter()
                .map(|(baby, role)| json!({ "baby": baby, "role": role }))
                .collect::<Vec<_>>(),
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else if rows.is_empty() {
        println!("No callers yet. Add one with `nestling admin add-caller <name>`.");
    } else {
        println!("{}", Table::new(&rows).with(Style::rounded()));
    }
    Ok(())
}
