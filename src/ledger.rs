// =============================================================================
// LEDGER ARITHMETIC
// =============================================================================
// Pure quantity accounting on a single `LedgerEntry`. Both store backends
// call these inside their transaction so the rules live in one place.
//
// Every function here either leaves the entry untouched and returns an error,
// or moves units while keeping `available + in_use == quantity`.
// =============================================================================

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{LedgerEdit, LedgerEntry, ResourceType};

/// Reject zero and negative quantities
pub fn validate_quantity(quantity: i32) -> AppResult<()> {
    if quantity <= 0 {
        return Err(AppError::InvalidRequest(format!(
            "quantity must be positive, got {}",
            quantity
        )));
    }
    Ok(())
}

pub fn validate_key(resource_key: &str) -> AppResult<()> {
    if resource_key.trim().is_empty() {
        return Err(AppError::InvalidRequest("resource_key is required".into()));
    }
    Ok(())
}

impl LedgerEntry {
    /// Fresh entry holding `quantity` idle units
    pub fn new(
        department_id: Uuid,
        resource_type: ResourceType,
        resource_key: impl Into<String>,
        name: impl Into<String>,
        quantity: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            department_id,
            resource_type,
            resource_key: resource_key.into(),
            name: name.into(),
            quantity,
            available: quantity,
            in_use: 0,
            updated_at: now,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.available >= 0 && self.in_use >= 0 && self.available + self.in_use == self.quantity
    }

    fn ensure_available(&self, quantity: i32) -> AppResult<()> {
        validate_quantity(quantity)?;
        if self.available < quantity {
            return Err(AppError::InsufficientAvailable {
                available: self.available,
                requested: quantity,
            });
        }
        Ok(())
    }

    /// available -> in_use, ownership unchanged
    pub fn allocate(&mut self, quantity: i32, now: DateTime<Utc>) -> AppResult<()> {
        self.ensure_available(quantity)?;
        self.available -= quantity;
        self.in_use += quantity;
        self.updated_at = now;
        Ok(())
    }

    /// in_use -> available, clamped to `in_use`. Returns the units moved.
    pub fn deallocate(&mut self, quantity: i32, now: DateTime<Utc>) -> AppResult<i32> {
        validate_quantity(quantity)?;
        let released = quantity.min(self.in_use);
        self.in_use -= released;
        self.available += released;
        self.updated_at = now;
        Ok(released)
    }

    /// Give up ownership of idle units (source side of a transfer)
    pub fn withdraw(&mut self, quantity: i32, now: DateTime<Utc>) -> AppResult<()> {
        self.ensure_available(quantity)?;
        self.available -= quantity;
        self.quantity -= quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Take ownership of idle units (destination side of a transfer)
    pub fn deposit(&mut self, quantity: i32, now: DateTime<Utc>) -> AppResult<()> {
        validate_quantity(quantity)?;
        self.available += quantity;
        self.quantity += quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Operator edit of the owned total. Units in use are never taken away.
    pub fn set_quantity(&mut self, quantity: i32, now: DateTime<Utc>) -> AppResult<()> {
        if quantity < self.in_use {
            return Err(AppError::InvalidRequest(format!(
                "{} has {} units in use; quantity cannot drop to {}",
                self.resource_key, self.in_use, quantity
            )));
        }
        self.quantity = quantity;
        self.available = quantity - self.in_use;
        self.updated_at = now;
        Ok(())
    }
}

/// Move `quantity` idle units from `source` into `destination`.
///
/// `destination` is `None` when the receiving department has no entry for
/// this key yet; a new entry is created with the source's display name.
pub fn transfer_between(
    source: &mut LedgerEntry,
    destination: Option<LedgerEntry>,
    to_department_id: Uuid,
    quantity: i32,
    now: DateTime<Utc>,
) -> AppResult<LedgerEntry> {
    source.withdraw(quantity, now)?;
    match destination {
        Some(mut entry) => {
            entry.deposit(quantity, now)?;
            Ok(entry)
        }
        None => Ok(LedgerEntry::new(
            to_department_id,
            source.resource_type,
            source.resource_key.clone(),
            source.name.clone(),
            quantity,
            now,
        )),
    }
}

/// Apply an operator edit to an existing entry or create it
pub fn apply_edit(
    department_id: Uuid,
    existing: Option<LedgerEntry>,
    edit: &LedgerEdit,
    now: DateTime<Utc>,
) -> AppResult<LedgerEntry> {
    validate_key(&edit.resource_key)?;
    if edit.quantity < 0 {
        return Err(AppError::InvalidRequest(format!(
            "quantity for {} cannot be negative",
            edit.resource_key
        )));
    }
    match existing {
        Some(mut entry) => {
            entry.set_quantity(edit.quantity, now)?;
            if !edit.name.trim().is_empty() {
                entry.name = edit.name.clone();
            }
            Ok(entry)
        }
        None => Ok(LedgerEntry::new(
            department_id,
            edit.resource_type,
            edit.resource_key.clone(),
            edit.name.clone(),
            edit.quantity,
            now,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ventilators(quantity: i32) -> LedgerEntry {
        LedgerEntry::new(
            Uuid::new_v4(),
            ResourceType::Equipment,
            "ventilator",
            "Ventilator",
            quantity,
            Utc::now(),
        )
    }

    #[test]
    fn transfer_creates_destination_and_conserves_quantity() {
        let now = Utc::now();
        let mut icu = ventilators(5);
        let emergency = Uuid::new_v4();

        let dest = transfer_between(&mut icu, None, emergency, 3, now).unwrap();

        assert_eq!((icu.quantity, icu.available), (2, 2));
        assert_eq!((dest.quantity, dest.available, dest.in_use), (3, 3, 0));
        assert_eq!(dest.department_id, emergency);
        assert_eq!(icu.quantity + dest.quantity, 5);
        assert!(icu.is_balanced() && dest.is_balanced());
    }

    #[test]
    fn transfer_increments_existing_destination() {
        let now = Utc::now();
        let mut icu = ventilators(5);
        let existing = ventilators(1);
        let dest =
            transfer_between(&mut icu, Some(existing.clone()), existing.department_id, 2, now)
                .unwrap();
        assert_eq!((dest.quantity, dest.available), (3, 3));
    }

    #[test]
    fn transfer_only_moves_idle_units() {
        let now = Utc::now();
        let mut icu = ventilators(5);
        icu.allocate(4, now).unwrap();

        let err = transfer_between(&mut icu, None, Uuid::new_v4(), 2, now).unwrap_err();

        assert!(matches!(
            err,
            AppError::InsufficientAvailable {
                available: 1,
                requested: 2
            }
        ));
        assert_eq!((icu.quantity, icu.available, icu.in_use), (5, 1, 4));
    }

    #[test]
    fn allocate_then_deallocate_restores_counts() {
        let now = Utc::now();
        let mut entry = ventilators(2);
        entry.allocate(1, now).unwrap();
        assert_eq!((entry.available, entry.in_use), (1, 1));
        assert_eq!(entry.deallocate(1, now).unwrap(), 1);
        assert_eq!((entry.available, entry.in_use, entry.quantity), (2, 0, 2));
    }

    #[test]
    fn deallocate_clamps_to_in_use() {
        let now = Utc::now();
        let mut entry = ventilators(3);
        entry.allocate(1, now).unwrap();
        assert_eq!(entry.deallocate(5, now).unwrap(), 1);
        assert_eq!((entry.available, entry.in_use), (3, 0));
        assert!(entry.is_balanced());
    }

    #[test]
    fn zero_quantity_is_invalid() {
        let mut entry = ventilators(3);
        assert!(matches!(
            entry.allocate(0, Utc::now()),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[test]
    fn edit_keeps_units_in_use() {
        let now = Utc::now();
        let mut entry = ventilators(4);
        entry.allocate(2, now).unwrap();
        let edit = LedgerEdit {
            resource_type: ResourceType::Equipment,
            resource_key: "ventilator".into(),
            name: String::new(),
            quantity: 6,
        };
        let updated = apply_edit(entry.department_id, Some(entry.clone()), &edit, now).unwrap();
        assert_eq!((updated.quantity, updated.available, updated.in_use), (6, 4, 2));
        assert_eq!(updated.name, "Ventilator");

        let shrink = LedgerEdit {
            quantity: 1,
            ..edit
        };
        assert!(apply_edit(entry.department_id, Some(entry), &shrink, now).is_err());
    }
}
