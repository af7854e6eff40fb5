//! Relationship descriptors.
//!
//! A relationship links a principal entity type to a dependent entity type
//! through a foreign-key property on the dependent. Either navigation may be
//! omitted; the session tracks the link per relationship regardless of which
//! navigations the caller can see.

/// The cardinality of a relationship seen from the principal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// One principal has an ordered collection of dependents.
    #[default]
    OneToMany,
    /// One principal has at most one dependent.
    OneToOne,
}

/// What happens to tracked dependents when their principal is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteBehavior {
    /// Clear the dependent's foreign key.
    #[default]
    SetNull,
    /// Delete the dependent as well.
    Cascade,
}

/// Metadata about a principal/dependent relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Relationship name, unique within a schema
    pub name: &'static str,
    pub kind: RelationshipKind,
    /// Principal entity type name
    pub principal: &'static str,
    /// Dependent entity type name
    pub dependent: &'static str,
    /// Foreign-key property on the dependent
    pub foreign_key: &'static str,
    /// Navigation on the principal (collection or single reference)
    pub principal_navigation: Option<&'static str>,
    /// Reference navigation on the dependent pointing back at the principal
    pub dependent_navigation: Option<&'static str>,
    /// Whether every dependent must have a principal when saved
    pub required: bool,
    pub on_delete: DeleteBehavior,
}

impl RelationshipInfo {
    const fn with_kind(
        kind: RelationshipKind,
        name: &'static str,
        principal: &'static str,
        dependent: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            principal,
            dependent,
            foreign_key,
            principal_navigation: None,
            dependent_navigation: None,
            required: false,
            on_delete: DeleteBehavior::SetNull,
        }
    }

    /// One principal, many dependents.
    pub const fn one_to_many(
        name: &'static str,
        principal: &'static str,
        dependent: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self::with_kind(
            RelationshipKind::OneToMany,
            name,
            principal,
            dependent,
            foreign_key,
        )
    }

    /// One principal, at most one dependent.
    pub const fn one_to_one(
        name: &'static str,
        principal: &'static str,
        dependent: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self::with_kind(
            RelationshipKind::OneToOne,
            name,
            principal,
            dependent,
            foreign_key,
        )
    }

    /// Set the principal-side navigation name.
    pub const fn principal_navigation(mut self, name: &'static str) -> Self {
        self.principal_navigation = Some(name);
        self
    }

    /// Set the dependent-side navigation name.
    pub const fn dependent_navigation(mut self, name: &'static str) -> Self {
        self.dependent_navigation = Some(name);
        self
    }

    /// Require a principal for every saved dependent.
    ///
    /// Required relationships cascade deletes unless overridden with
    /// [`RelationshipInfo::on_delete`] afterwards.
    pub const fn required(mut self, value: bool) -> Self {
        self.required = value;
        if value {
            self.on_delete = DeleteBehavior::Cascade;
        }
        self
    }

    pub const fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        self.on_delete = behavior;
        self
    }

    /// Whether the principal holds a collection of dependents.
    pub const fn is_collection(&self) -> bool {
        matches!(self.kind, RelationshipKind::OneToMany)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let rel = RelationshipInfo::one_to_many("company_employees", "Company", "Employee", "company_id")
            .principal_navigation("employees");
        assert_eq!(rel.kind, RelationshipKind::OneToMany);
        assert!(rel.is_collection());
        assert_eq!(rel.principal_navigation, Some("employees"));
        assert_eq!(rel.dependent_navigation, None);
        assert!(!rel.required);
        assert_eq!(rel.on_delete, DeleteBehavior::SetNull);
    }

    #[test]
    fn required_implies_cascade_unless_overridden() {
        let rel = RelationshipInfo::one_to_one("project_manager", "Project", "Manager", "project_id")
            .required(true);
        assert_eq!(rel.on_delete, DeleteBehavior::Cascade);
        assert!(!rel.is_collection());

        let rel = rel.on_delete(DeleteBehavior::SetNull);
        assert!(rel.required);
        assert_eq!(rel.on_delete, DeleteBehavior::SetNull);
    }
}
