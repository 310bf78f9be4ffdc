//! Structural validation of operations.
//!
//! Validation runs before conflict detection. A malformed operation is
//! rejected immediately and never reaches the log or the conflict pipeline.

use crate::{error::Result, Error, ItemDraft, ItemPatch, OpKind, Operation};

/// Validate an operation's shape and field values.
pub fn validate_operation(op: &Operation) -> Result<()> {
    require("opId", &op.op_id)?;
    require("userId", &op.user_id)?;

    match &op.kind {
        OpKind::Insert(insert) => validate_draft(&insert.item),
        OpKind::Update(update) => {
            require("itemId", &update.item_id)?;
            if update.base_version == 0 {
                return Err(Error::InvalidOperation(
                    "baseVersion must be at least 1".to_string(),
                ));
            }
            validate_patch(&update.item_id, &update.patch)
        }
        OpKind::Delete(delete) => require("itemId", &delete.item_id),
        OpKind::Move(relocate) => {
            require("itemId", &relocate.item_id)?;
            require("room", &relocate.room)
        }
    }
}

fn validate_draft(draft: &ItemDraft) -> Result<()> {
    require("item.id", &draft.id)?;
    require("item.room", &draft.room)?;
    require("item.facultyId", &draft.faculty_id)?;
    require("item.subject", &draft.subject)?;
    if draft.depends_on.iter().any(|dep| dep == &draft.id) {
        return Err(Error::InvalidOperation(format!(
            "item {} cannot depend on itself",
            draft.id
        )));
    }
    Ok(())
}

fn validate_patch(item_id: &str, patch: &ItemPatch) -> Result<()> {
    if patch.is_empty() {
        return Err(Error::InvalidOperation(format!(
            "update of {item_id} changes no field"
        )));
    }
    if let Some(room) = &patch.room {
        require("patch.room", room)?;
    }
    if let Some(faculty) = &patch.faculty_id {
        require("patch.facultyId", faculty)?;
    }
    if let Some(subject) = &patch.subject {
        require("patch.subject", subject)?;
    }
    if let Some(deps) = &patch.depends_on {
        if deps.iter().any(|dep| dep == item_id) {
            return Err(Error::InvalidOperation(format!(
                "item {item_id} cannot depend on itself"
            )));
        }
    }
    Ok(())
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::MissingField(field.to_string()))
    } else {
        Ok(())
    }
}
