//! Entity command handlers

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};

use lorekeep_core::{Collection, Entity, EntityId, Workspace};

use crate::output::Output;

/// Create an entity from `field=value` assignments
pub fn add(
    workspace: &mut Workspace,
    collection: Collection,
    assignments: Vec<String>,
    output: &Output,
) -> Result<()> {
    let mut fields = Map::new();
    apply_assignments(&mut fields, &assignments)?;
    // Placeholder; the store allocates the real id
    fields.insert("id".to_string(), Value::from(0));

    let draft = Entity::from_fields(collection, fields)
        .with_context(|| format!("Invalid {}", collection))?;
    let entity = workspace.create(draft.record)?;

    output.success(&format!("Created {} {}", entity.collection(), entity.id));
    output.print_entity(&entity)
}

/// Change fields of an existing entity
pub fn update(
    workspace: &mut Workspace,
    collection: Collection,
    id: EntityId,
    assignments: Vec<String>,
    unset: Vec<String>,
    output: &Output,
) -> Result<()> {
    if assignments.is_empty() && unset.is_empty() {
        bail!("Nothing to change. Use --set field=value or --unset field.");
    }

    let current = workspace
        .get(collection, id)?
        .ok_or_else(|| anyhow!("{} {} not found", collection, id))?;

    let mut fields = current.to_fields();
    apply_assignments(&mut fields, &assignments)?;
    for field in &unset {
        if field == "id" {
            bail!("The id of an entity cannot be changed");
        }
        fields.remove(field);
    }
    fields.insert("id".to_string(), Value::from(id.get()));

    let changed = Entity::from_fields(collection, fields)
        .with_context(|| format!("Invalid {}", collection))?;
    if changed == current {
        output.message("No changes.");
        return Ok(());
    }

    let entity = workspace.update(changed)?;
    output.success(&format!("Updated {} {}", entity.collection(), entity.id));
    output.print_entity(&entity)
}

/// Delete an entity and apply the reference policy to its dependents
pub fn remove(
    workspace: &mut Workspace,
    collection: Collection,
    id: EntityId,
    output: &Output,
) -> Result<()> {
    let report = workspace.delete(collection, id)?;

    if output.is_json() {
        return output.print_json(&report);
    }

    output.success(&format!("Deleted {} {}", collection, id));
    for (c, dependent) in report.deleted.iter().skip(1) {
        output.message(&format!("  also deleted {} {}", c, dependent));
    }
    for (c, dependent) in &report.cleared {
        output.message(&format!("  cleared reference on {} {}", c, dependent));
    }
    Ok(())
}

pub fn show(
    workspace: &Workspace,
    collection: Collection,
    id: EntityId,
    output: &Output,
) -> Result<()> {
    let entity = workspace
        .get(collection, id)?
        .ok_or_else(|| anyhow!("{} {} not found", collection, id))?;
    output.print_entity(&entity)
}

/// List one collection, or everything
pub fn list(workspace: &Workspace, collection: Option<Collection>, output: &Output) -> Result<()> {
    let entities = match collection {
        Some(c) => workspace.list(c)?,
        None => workspace.list_all()?,
    };
    output.print_entities(&entities)
}

/// Show operations waiting to be pushed
pub fn pending(workspace: &Workspace, output: &Output) -> Result<()> {
    let ops = workspace.pending_ops()?;
    output.print_ops(&ops)
}

fn apply_assignments(fields: &mut Map<String, Value>, assignments: &[String]) -> Result<()> {
    for raw in assignments {
        let (field, value) = parse_assignment(raw)?;
        if field == "id" {
            bail!("The id of an entity is assigned by the store");
        }
        fields.insert(field, value);
    }
    Ok(())
}

/// Parse `field=value` or `field:=<json>`
///
/// Reference fields (`*_id`) take integers; `null` or an empty value clears
/// them. Everything else is a string unless given as raw JSON with `:=`.
pub fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    if let Some((field, json)) = raw.split_once(":=") {
        let field = checked_field(field, raw)?;
        let value = serde_json::from_str(json)
            .with_context(|| format!("Invalid JSON value for '{}'", field))?;
        return Ok((field, value));
    }

    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected field=value, got '{}'", raw))?;
    let field = checked_field(field, raw)?;

    if field.ends_with("_id") {
        let value = match value.trim() {
            "" | "null" => Value::Null,
            id => Value::from(
                id.parse::<i64>()
                    .with_context(|| format!("'{}' must be an integer id", field))?,
            ),
        };
        return Ok((field, value));
    }

    Ok((field, Value::String(value.to_string())))
}

fn checked_field(field: &str, raw: &str) -> Result<String> {
    let field = field.trim();
    if field.is_empty() {
        bail!("Missing field name in '{}'", raw);
    }
    Ok(field.to_string())
}
