//! Class and field metadata catalog.
//!
//! # Responsibility
//! - Classify every (class, field) pair into one `FieldKind`.
//! - Ship the built-in linguistic schema used by sessions and serializers.
//! - Hold user-added custom fields and merge catalogs with the rename rule.
//!
//! # Invariants
//! - Built-in field ids are `class_id * 1000 + ordinal`.
//! - Custom field ids start at `class_id * 1000 + 500` and are never reused.
//! - Schema field order is declaration order, then custom fields by name.
//! - Field names are unique per class.

use crate::model::id::ObjectId;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ClassId = u32;
pub type FieldId = u32;

const CUSTOM_FIELD_BASE: FieldId = 500;

static CUSTOM_FIELD_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\p{L}[\p{L}\p{N}_ \-]*$").expect("valid custom field name regex")
});

/// Value type of a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Boolean,
    Integer,
    /// Unix epoch milliseconds.
    Time,
    Guid,
    Unicode,
    /// Rich text carried as an opaque payload.
    FormattedText,
}

/// Storage/ownership classification of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Scalar(ScalarType),
    /// One alternative per writing-system tag.
    MultiString,
    OwningAtomic,
    OwningCollection,
    OwningSequence,
    ReferenceAtomic,
    ReferenceCollection,
    ReferenceSequence,
}

/// Cardinality shape shared by owning and reference kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Atomic,
    Collection,
    Sequence,
}

impl FieldKind {
    pub fn is_owning(self) -> bool {
        matches!(
            self,
            Self::OwningAtomic | Self::OwningCollection | Self::OwningSequence
        )
    }

    pub fn is_reference(self) -> bool {
        matches!(
            self,
            Self::ReferenceAtomic | Self::ReferenceCollection | Self::ReferenceSequence
        )
    }

    /// True for every kind whose value points at other objects.
    pub fn is_object(self) -> bool {
        self.is_owning() || self.is_reference()
    }

    pub fn cardinality(self) -> Option<Cardinality> {
        match self {
            Self::OwningAtomic | Self::ReferenceAtomic => Some(Cardinality::Atomic),
            Self::OwningCollection | Self::ReferenceCollection => Some(Cardinality::Collection),
            Self::OwningSequence | Self::ReferenceSequence => Some(Cardinality::Sequence),
            Self::Scalar(_) | Self::MultiString => None,
        }
    }

    /// Stable type name used in the custom-field block.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Scalar(ScalarType::Boolean) => "Boolean",
            Self::Scalar(ScalarType::Integer) => "Integer",
            Self::Scalar(ScalarType::Time) => "Time",
            Self::Scalar(ScalarType::Guid) => "Guid",
            Self::Scalar(ScalarType::Unicode) => "Unicode",
            Self::Scalar(ScalarType::FormattedText) => "String",
            Self::MultiString => "MultiUnicode",
            Self::OwningAtomic => "OwningAtomic",
            Self::OwningCollection => "OwningCollection",
            Self::OwningSequence => "OwningSequence",
            Self::ReferenceAtomic => "ReferenceAtomic",
            Self::ReferenceCollection => "ReferenceCollection",
            Self::ReferenceSequence => "ReferenceSequence",
        }
    }

    pub fn parse_type_name(value: &str) -> Option<Self> {
        let kind = match value {
            "Boolean" => Self::Scalar(ScalarType::Boolean),
            "Integer" => Self::Scalar(ScalarType::Integer),
            "Time" => Self::Scalar(ScalarType::Time),
            "Guid" => Self::Scalar(ScalarType::Guid),
            "Unicode" => Self::Scalar(ScalarType::Unicode),
            "String" => Self::Scalar(ScalarType::FormattedText),
            "MultiUnicode" => Self::MultiString,
            "OwningAtomic" => Self::OwningAtomic,
            "OwningCollection" => Self::OwningCollection,
            "OwningSequence" => Self::OwningSequence,
            "ReferenceAtomic" => Self::ReferenceAtomic,
            "ReferenceCollection" => Self::ReferenceCollection,
            "ReferenceSequence" => Self::ReferenceSequence,
            _ => return None,
        };
        Some(kind)
    }

    /// Text-bearing kinds carry a writing-system selector when custom.
    pub fn takes_ws_selector(self) -> bool {
        matches!(
            self,
            Self::Scalar(ScalarType::Unicode)
                | Self::Scalar(ScalarType::FormattedText)
                | Self::MultiString
        )
    }
}

/// Per (class, field) metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub id: FieldId,
    pub class: ClassId,
    pub name: String,
    pub kind: FieldKind,
    /// Required class of targets for owning/reference kinds.
    pub target_class: Option<ClassId>,
    /// Present only for user-added fields.
    pub custom: Option<CustomFieldExtras>,
}

impl FieldDescriptor {
    pub fn is_custom(&self) -> bool {
        self.custom.is_some()
    }
}

/// Type-specific attributes of a custom field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomFieldExtras {
    pub ws_selector: Option<i32>,
    pub list_root: Option<ObjectId>,
}

/// Declaration of one user-added field, as read from or written to the
/// repository-level custom-field block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomFieldDef {
    pub class: String,
    pub name: String,
    pub kind: FieldKind,
    pub ws_selector: Option<i32>,
    pub dest_class: Option<String>,
    pub list_root: Option<ObjectId>,
}

impl CustomFieldDef {
    pub fn new(class: impl Into<String>, name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            kind,
            ws_selector: None,
            dest_class: None,
            list_root: None,
        }
    }
}

/// Outcome of one collision-driven rename during a catalog merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRename {
    pub class: String,
    pub old_name: String,
    pub new_name: String,
    pub field: FieldId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    pub id: ClassId,
    pub name: String,
    fields: Vec<FieldId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    UnknownClass(String),
    UnknownField { class: String, field: String },
    DuplicateField { class: String, name: String },
    InvalidFieldName(String),
    MissingTargetClass { class: String, name: String },
    TooManyCustomFields(String),
}

impl Display for CatalogError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownClass(name) => write!(f, "unknown class `{name}`"),
            Self::UnknownField { class, field } => {
                write!(f, "class `{class}` has no field `{field}`")
            }
            Self::DuplicateField { class, name } => {
                write!(f, "class `{class}` already declares field `{name}`")
            }
            Self::InvalidFieldName(name) => write!(f, "invalid custom field name `{name}`"),
            Self::MissingTargetClass { class, name } => write!(
                f,
                "object-valued custom field `{class}.{name}` requires a destination class"
            ),
            Self::TooManyCustomFields(class) => {
                write!(f, "class `{class}` has no free custom field ids")
            }
        }
    }
}

impl Error for CatalogError {}

/// Field metadata catalog shared by every component resolving fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaCatalog {
    classes: BTreeMap<ClassId, ClassDescriptor>,
    class_by_name: HashMap<String, ClassId>,
    fields: BTreeMap<FieldId, FieldDescriptor>,
    field_by_name: HashMap<(ClassId, String), FieldId>,
}

use FieldKind::*;
use ScalarType::*;

const BUILTIN_CLASSES: &[(ClassId, &str)] = &[
    (1, "LangProject"),
    (2, "LexDb"),
    (3, "LexEntry"),
    (4, "LexSense"),
    (5, "LexExampleSentence"),
    (6, "CmPossibilityList"),
    (7, "CmPossibility"),
    (8, "PhEnvironment"),
    (9, "Text"),
];

const BUILTIN_FIELDS: &[(&str, &str, FieldKind, Option<&str>)] = &[
    ("LangProject", "Name", MultiString, None),
    ("LangProject", "LexDb", OwningAtomic, Some("LexDb")),
    ("LangProject", "Lists", OwningCollection, Some("CmPossibilityList")),
    ("LangProject", "Texts", OwningCollection, Some("Text")),
    ("LangProject", "Environments", OwningSequence, Some("PhEnvironment")),
    ("LexDb", "Entries", OwningCollection, Some("LexEntry")),
    ("LexEntry", "CitationForm", MultiString, None),
    ("LexEntry", "HomographNumber", Scalar(Integer), None),
    ("LexEntry", "DateCreated", Scalar(Time), None),
    ("LexEntry", "Senses", OwningSequence, Some("LexSense")),
    ("LexEntry", "ComplexFormComponents", ReferenceSequence, Some("LexEntry")),
    ("LexEntry", "DialectLabels", ReferenceSequence, Some("CmPossibility")),
    ("LexEntry", "DoNotPublish", Scalar(Boolean), None),
    ("LexSense", "Gloss", MultiString, None),
    ("LexSense", "Definition", MultiString, None),
    ("LexSense", "Senses", OwningSequence, Some("LexSense")),
    ("LexSense", "SemanticDomains", ReferenceCollection, Some("CmPossibility")),
    ("LexSense", "Status", ReferenceAtomic, Some("CmPossibility")),
    ("LexSense", "Example", OwningAtomic, Some("LexExampleSentence")),
    ("LexSense", "ImportResidue", Scalar(FormattedText), None),
    ("LexExampleSentence", "Example", MultiString, None),
    ("LexExampleSentence", "Reference", Scalar(Unicode), None),
    ("CmPossibilityList", "Name", MultiString, None),
    ("CmPossibilityList", "Possibilities", OwningSequence, Some("CmPossibility")),
    ("CmPossibility", "Name", MultiString, None),
    ("CmPossibility", "Abbreviation", MultiString, None),
    ("CmPossibility", "SubPossibilities", OwningSequence, Some("CmPossibility")),
    ("CmPossibility", "Confirmed", Scalar(Boolean), None),
    ("PhEnvironment", "Name", MultiString, None),
    ("PhEnvironment", "StringRepresentation", Scalar(Unicode), None),
    ("PhEnvironment", "ValidationMessage", Scalar(Unicode), None),
    ("Text", "Name", MultiString, None),
    ("Text", "Contents", Scalar(FormattedText), None),
    ("Text", "Source", Scalar(Guid), None),
    ("Text", "Genres", ReferenceCollection, Some("CmPossibility")),
];

impl MetaCatalog {
    /// Empty catalog; mostly useful to tests building ad-hoc schemas.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the built-in linguistic schema.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for (id, name) in BUILTIN_CLASSES {
            catalog.insert_class(*id, name);
        }
        let mut ordinals: HashMap<ClassId, FieldId> = HashMap::new();
        for (class_name, field_name, kind, target) in BUILTIN_FIELDS {
            let class = catalog.class_by_name[*class_name];
            let ordinal = ordinals.entry(class).or_insert(0);
            *ordinal += 1;
            let target_class = target.map(|name| catalog.class_by_name[name]);
            catalog.insert_field(FieldDescriptor {
                id: class * 1000 + *ordinal,
                class,
                name: (*field_name).to_string(),
                kind: *kind,
                target_class,
                custom: None,
            });
        }
        catalog
    }

    /// Registers one class; existing classes with the same id are replaced.
    pub fn insert_class(&mut self, id: ClassId, name: &str) {
        self.class_by_name.insert(name.to_string(), id);
        self.classes.insert(
            id,
            ClassDescriptor {
                id,
                name: name.to_string(),
                fields: Vec::new(),
            },
        );
    }

    fn insert_field(&mut self, descriptor: FieldDescriptor) {
        if let Some(class) = self.classes.get_mut(&descriptor.class) {
            class.fields.push(descriptor.id);
        }
        self.field_by_name
            .insert((descriptor.class, descriptor.name.clone()), descriptor.id);
        self.fields.insert(descriptor.id, descriptor);
    }

    pub fn class(&self, id: ClassId) -> Option<&ClassDescriptor> {
        self.classes.get(&id)
    }

    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.class_by_name.get(name).copied()
    }

    pub fn class_name(&self, id: ClassId) -> Option<&str> {
        self.classes.get(&id).map(|class| class.name.as_str())
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.classes.values()
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldDescriptor> {
        self.fields.get(&id)
    }

    pub fn field_by_name(&self, class: ClassId, name: &str) -> Option<&FieldDescriptor> {
        self.field_by_name
            .get(&(class, name.to_string()))
            .and_then(|id| self.fields.get(id))
    }

    /// Resolves `Class.Field` names; convenience for callers and tests.
    pub fn resolve(&self, class: &str, field: &str) -> Result<FieldId, CatalogError> {
        let class_id = self
            .class_id(class)
            .ok_or_else(|| CatalogError::UnknownClass(class.to_string()))?;
        self.field_by_name(class_id, field)
            .map(|descriptor| descriptor.id)
            .ok_or_else(|| CatalogError::UnknownField {
                class: class.to_string(),
                field: field.to_string(),
            })
    }

    /// Fields of one class in schema order: built-ins as declared, then
    /// custom fields ascending by name.
    pub fn fields_of(&self, class: ClassId) -> Vec<&FieldDescriptor> {
        let Some(descriptor) = self.classes.get(&class) else {
            return Vec::new();
        };
        let mut builtin = Vec::new();
        let mut custom = Vec::new();
        for id in &descriptor.fields {
            if let Some(field) = self.fields.get(id) {
                if field.is_custom() {
                    custom.push(field);
                } else {
                    builtin.push(field);
                }
            }
        }
        custom.sort_by(|a, b| a.name.cmp(&b.name));
        builtin.extend(custom);
        builtin
    }

    /// All custom field declarations ordered by (class name, field name).
    pub fn custom_fields(&self) -> Vec<CustomFieldDef> {
        let mut defs: Vec<CustomFieldDef> = self
            .fields
            .values()
            .filter_map(|field| {
                let extras = field.custom.as_ref()?;
                Some(CustomFieldDef {
                    class: self.class_name(field.class)?.to_string(),
                    name: field.name.clone(),
                    kind: field.kind,
                    ws_selector: extras.ws_selector,
                    dest_class: field
                        .target_class
                        .and_then(|id| self.class_name(id))
                        .map(str::to_string),
                    list_root: extras.list_root,
                })
            })
            .collect();
        defs.sort_by(|a, b| (a.class.as_str(), a.name.as_str()).cmp(&(b.class.as_str(), b.name.as_str())));
        defs
    }

    /// Declares one custom field and returns its new id.
    pub fn add_custom_field(&mut self, def: &CustomFieldDef) -> Result<FieldId, CatalogError> {
        let name = def.name.trim();
        if !is_valid_custom_field_name(name) {
            return Err(CatalogError::InvalidFieldName(def.name.clone()));
        }
        let class = self
            .class_id(&def.class)
            .ok_or_else(|| CatalogError::UnknownClass(def.class.clone()))?;
        if self.field_by_name(class, name).is_some() {
            return Err(CatalogError::DuplicateField {
                class: def.class.clone(),
                name: name.to_string(),
            });
        }
        let target_class = match (&def.dest_class, def.kind.is_object()) {
            (Some(dest), true) => Some(
                self.class_id(dest)
                    .ok_or_else(|| CatalogError::UnknownClass(dest.clone()))?,
            ),
            (None, true) => {
                return Err(CatalogError::MissingTargetClass {
                    class: def.class.clone(),
                    name: name.to_string(),
                })
            }
            (_, false) => None,
        };

        let id = self.next_custom_field_id(class, &def.class)?;
        self.insert_field(FieldDescriptor {
            id,
            class,
            name: name.to_string(),
            kind: def.kind,
            target_class,
            custom: Some(CustomFieldExtras {
                ws_selector: def.ws_selector,
                list_root: def.list_root,
            }),
        });
        Ok(id)
    }

    /// Merges incoming custom field declarations into this catalog.
    ///
    /// Same class+name with the same kind is already present and skipped.
    /// Same class+name with a different kind renames the existing (older)
    /// field to the base name plus the smallest non-negative integer suffix
    /// no sibling of that class already uses, then adds the incoming one.
    ///
    /// The merge is all or nothing: on error the catalog is unchanged.
    pub fn merge_custom_fields(
        &mut self,
        incoming: &[CustomFieldDef],
    ) -> Result<Vec<FieldRename>, CatalogError> {
        let mut staged = self.clone();
        let renames = staged.apply_custom_fields(incoming)?;
        *self = staged;
        for rename in &renames {
            log::info!(
                "event=custom_field_renamed module=meta status=ok class={} old_name={} new_name={}",
                rename.class,
                rename.old_name,
                rename.new_name
            );
        }
        Ok(renames)
    }

    fn apply_custom_fields(
        &mut self,
        incoming: &[CustomFieldDef],
    ) -> Result<Vec<FieldRename>, CatalogError> {
        let mut renames = Vec::new();
        for def in incoming {
            let class = self
                .class_id(&def.class)
                .ok_or_else(|| CatalogError::UnknownClass(def.class.clone()))?;
            let existing = self
                .field_by_name(class, def.name.trim())
                .map(|field| (field.id, field.kind, field.is_custom()));
            match existing {
                Some((_, kind, _)) if kind == def.kind => continue,
                Some((field_id, _, true)) => {
                    let new_name = self.collision_free_name(class, def.name.trim());
                    self.rename_field(field_id, &new_name);
                    renames.push(FieldRename {
                        class: def.class.clone(),
                        old_name: def.name.trim().to_string(),
                        new_name,
                        field: field_id,
                    });
                    self.add_custom_field(def)?;
                }
                Some((_, _, false)) => {
                    return Err(CatalogError::DuplicateField {
                        class: def.class.clone(),
                        name: def.name.clone(),
                    })
                }
                None => {
                    self.add_custom_field(def)?;
                }
            }
        }
        Ok(renames)
    }

    fn rename_field(&mut self, field_id: FieldId, new_name: &str) {
        let Some(field) = self.fields.get_mut(&field_id) else {
            return;
        };
        self.field_by_name.remove(&(field.class, field.name.clone()));
        field.name = new_name.to_string();
        self.field_by_name
            .insert((field.class, new_name.to_string()), field_id);
    }

    fn collision_free_name(&self, class: ClassId, base: &str) -> String {
        let used: BTreeSet<u64> = self
            .fields_of(class)
            .into_iter()
            .filter_map(|field| {
                let suffix = field.name.strip_prefix(base)?;
                if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                suffix.parse::<u64>().ok()
            })
            .collect();
        let suffix = (0u64..)
            .find(|candidate| !used.contains(candidate))
            .unwrap_or_default();
        format!("{base}{suffix}")
    }

    fn next_custom_field_id(&self, class: ClassId, class_name: &str) -> Result<FieldId, CatalogError> {
        let first = class * 1000 + CUSTOM_FIELD_BASE;
        let next = self
            .fields
            .range(first..class * 1000 + 1000)
            .next_back()
            .map_or(first, |(id, _)| id + 1);
        if next >= class * 1000 + 1000 {
            return Err(CatalogError::TooManyCustomFields(class_name.to_string()));
        }
        Ok(next)
    }
}

fn is_valid_custom_field_name(name: &str) -> bool {
    CUSTOM_FIELD_NAME_RE.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::{CatalogError, CustomFieldDef, FieldKind, MetaCatalog, ScalarType};

    #[test]
    fn builtin_field_ids_follow_class_ordinal_scheme() {
        let catalog = MetaCatalog::builtin();
        let senses = catalog.resolve("LexEntry", "Senses").unwrap();
        assert_eq!(senses, 3004);
        let field = catalog.field(senses).unwrap();
        assert_eq!(field.kind, FieldKind::OwningSequence);
        assert_eq!(field.target_class, catalog.class_id("LexSense"));
    }

    #[test]
    fn custom_fields_follow_builtins_in_schema_order() {
        let mut catalog = MetaCatalog::builtin();
        let class = catalog.class_id("LexSense").unwrap();
        catalog
            .add_custom_field(&CustomFieldDef::new("LexSense", "Zeta", FieldKind::MultiString))
            .unwrap();
        catalog
            .add_custom_field(&CustomFieldDef::new(
                "LexSense",
                "Alpha",
                FieldKind::Scalar(ScalarType::Integer),
            ))
            .unwrap();

        let names: Vec<_> = catalog
            .fields_of(class)
            .into_iter()
            .map(|field| field.name.as_str())
            .collect();
        assert_eq!(names.last(), Some(&"Zeta"));
        assert_eq!(names[names.len() - 2], "Alpha");
        assert_eq!(names[0], "Gloss");
    }

    #[test]
    fn object_custom_field_requires_destination_class() {
        let mut catalog = MetaCatalog::builtin();
        let err = catalog
            .add_custom_field(&CustomFieldDef::new(
                "LexEntry",
                "Related",
                FieldKind::ReferenceCollection,
            ))
            .unwrap_err();
        assert!(matches!(err, CatalogError::MissingTargetClass { .. }));
    }

    #[test]
    fn merge_with_same_kind_is_a_no_op() {
        let mut catalog = MetaCatalog::builtin();
        let def = CustomFieldDef::new("LexEntry", "Note", FieldKind::MultiString);
        catalog.add_custom_field(&def).unwrap();
        let renames = catalog.merge_custom_fields(&[def]).unwrap();
        assert!(renames.is_empty());
        assert_eq!(catalog.custom_fields().len(), 1);
    }

    #[test]
    fn failed_merge_leaves_the_colliding_field_in_place() {
        let mut catalog = MetaCatalog::builtin();
        let original = catalog
            .add_custom_field(&CustomFieldDef::new(
                "LexSense",
                "UsageNote",
                FieldKind::Scalar(ScalarType::Unicode),
            ))
            .unwrap();
        let before = catalog.clone();

        let mut incoming = CustomFieldDef::new("LexSense", "UsageNote", FieldKind::ReferenceAtomic);
        incoming.dest_class = Some("NoSuchClass".to_string());
        let err = catalog
            .merge_custom_fields(&[
                CustomFieldDef::new("LexEntry", "Register", FieldKind::MultiString),
                incoming,
            ])
            .unwrap_err();

        assert!(matches!(err, CatalogError::UnknownClass(name) if name == "NoSuchClass"));
        assert_eq!(catalog, before);
        assert_eq!(catalog.resolve("LexSense", "UsageNote").unwrap(), original);
        assert!(catalog.resolve("LexSense", "UsageNote0").is_err());
        assert!(catalog.resolve("LexEntry", "Register").is_err());
    }
}
