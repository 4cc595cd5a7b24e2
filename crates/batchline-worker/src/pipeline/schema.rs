//! Target schema for staged contact records

use serde::Serialize;

/// A field of the fixed target schema, in validation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    ExternalId,
    FullName,
    Email,
    Phone,
    SignupDate,
    LifetimeValue,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::ExternalId,
        Field::FullName,
        Field::Email,
        Field::Phone,
        Field::SignupDate,
        Field::LifetimeValue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::ExternalId => "external_id",
            Field::FullName => "full_name",
            Field::Email => "email",
            Field::Phone => "phone",
            Field::SignupDate => "signup_date",
            Field::LifetimeValue => "lifetime_value",
        }
    }

    /// Folded header keys that map onto this field.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::ExternalId => &["external_id", "id", "customer_id", "record_id"],
            Field::FullName => &["full_name", "name", "contact_name"],
            Field::Email => &["email", "email_address", "e_mail"],
            Field::Phone => &["phone", "phone_number", "mobile"],
            Field::SignupDate => &["signup_date", "signed_up", "created_at"],
            Field::LifetimeValue => &["lifetime_value", "ltv"],
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, Field::ExternalId | Field::FullName)
    }

    /// Maximum length in characters, for free-text fields.
    pub fn max_len(self) -> Option<usize> {
        match self {
            Field::ExternalId => Some(128),
            Field::FullName => Some(256),
            _ => None,
        }
    }

    fn from_folded(key: &str) -> Option<Field> {
        Field::ALL
            .into_iter()
            .find(|field| field.aliases().contains(&key))
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lowercase, with spaces, hyphens and dots turned into underscores.
pub fn fold_key(header: &str) -> String {
    header
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' | '.' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Which header column feeds each schema field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    by_column: Vec<Option<Field>>,
}

impl FieldMapping {
    /// Map normalized headers onto the schema. When several headers fold to
    /// aliases of the same field, the leftmost wins and the rest stay unmapped.
    pub fn resolve<S: AsRef<str>>(headers: &[S]) -> Self {
        let mut by_column = Vec::with_capacity(headers.len());
        let mut taken: Vec<Field> = Vec::new();

        for header in headers {
            let field = Field::from_folded(&fold_key(header.as_ref()))
                .filter(|field| !taken.contains(field));
            if let Some(field) = field {
                taken.push(field);
            }
            by_column.push(field);
        }

        Self { by_column }
    }

    /// Zero-based column index feeding `field`.
    pub fn column_for(&self, field: Field) -> Option<usize> {
        self.by_column.iter().position(|f| *f == Some(field))
    }

    pub fn field_at(&self, column: usize) -> Option<Field> {
        self.by_column.get(column).copied().flatten()
    }

    /// Required fields with no column at all.
    pub fn missing_required(&self) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|f| f.is_required() && self.column_for(*f).is_none())
            .collect()
    }
}
