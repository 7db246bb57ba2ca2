//! Class metadata and instance layout.
//!
//! Classes are immutable once defined. The table is append-only and shared
//! by every thread; lookups take a read lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::bytecode::FieldKind;
use super::program::ClassSpec;
use crate::error::{Result, RuntimeError};
use crate::isa::align_up;

/// Size of the object header (class id + lock word) preceding the fields.
pub const OBJECT_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Classes every runtime defines, at fixed ids.
pub mod well_known {
    use super::ClassId;

    pub const OBJECT: ClassId = ClassId(0);
    pub const THROWABLE: ClassId = ClassId(1);
    pub const NULL_POINTER_EXCEPTION: ClassId = ClassId(2);
    pub const CLASS_CAST_EXCEPTION: ClassId = ClassId(3);
    pub const ARITHMETIC_EXCEPTION: ClassId = ClassId(4);
    pub const OUT_OF_MEMORY_ERROR: ClassId = ClassId(5);
    pub const STACK_OVERFLOW_ERROR: ClassId = ClassId(6);
    pub const NO_SUCH_FIELD_ERROR: ClassId = ClassId(7);
    pub const NO_CLASS_DEF_FOUND_ERROR: ClassId = ClassId(8);
    pub const INSTANTIATION_ERROR: ClassId = ClassId(9);
    pub const VERIFY_ERROR: ClassId = ClassId(10);

    /// (name, superclass) in id order.
    pub(super) const BUILTINS: &[(&str, Option<ClassId>)] = &[
        ("java.lang.Object", None),
        ("java.lang.Throwable", Some(OBJECT)),
        ("java.lang.NullPointerException", Some(THROWABLE)),
        ("java.lang.ClassCastException", Some(THROWABLE)),
        ("java.lang.ArithmeticException", Some(THROWABLE)),
        ("java.lang.OutOfMemoryError", Some(THROWABLE)),
        ("java.lang.StackOverflowError", Some(THROWABLE)),
        ("java.lang.NoSuchFieldError", Some(THROWABLE)),
        ("java.lang.NoClassDefFoundError", Some(THROWABLE)),
        ("java.lang.InstantiationError", Some(THROWABLE)),
        ("java.lang.VerifyError", Some(THROWABLE)),
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    /// Byte offset from the start of the object
    pub offset: u16,
    pub declaring_class: ClassId,
}

/// Field declaration handed to [`ClassTable::define`].
#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub super_class: Option<ClassId>,
    pub is_abstract: bool,
    /// Inherited fields first
    pub fields: Vec<Field>,
    pub instance_size: usize,
    /// Offsets of every reference field, for the collector
    pub reference_offsets: Arc<[u16]>,
    /// Depth in the hierarchy; `Object` is 0
    depth: usize,
}

impl Class {
    pub fn find_field(&self, name: &str) -> Option<&Field> {
        // Later (subclass) declarations shadow inherited ones.
        self.fields.iter().rev().find(|f| f.name == name)
    }
}

/// Lay out `decls` after an object of `base_size` bytes.
///
/// References come first so the collector scans a dense prefix; the rest
/// follow by descending width, each naturally aligned.
fn layout_fields(
    class: ClassId,
    base_size: usize,
    decls: &[FieldDecl],
) -> Result<(Vec<Field>, usize)> {
    let mut order: Vec<&FieldDecl> = decls.iter().collect();
    order.sort_by_key(|d| (!d.kind.is_reference(), std::cmp::Reverse(d.kind.width())));

    let mut offset = base_size;
    let mut fields = Vec::with_capacity(decls.len());
    for decl in order {
        offset = align_up(offset, decl.kind.width());
        let field_offset = u16::try_from(offset).map_err(|_| {
            RuntimeError::InvalidProgram(format!("field `{}` is beyond 64 KiB", decl.name))
        })?;
        fields.push(Field {
            name: decl.name.clone(),
            kind: decl.kind,
            offset: field_offset,
            declaring_class: class,
        });
        offset += decl.kind.width();
    }
    Ok((fields, offset))
}

#[derive(Debug, Default)]
struct Tables {
    classes: Vec<Arc<Class>>,
    by_name: HashMap<String, ClassId>,
}

impl Tables {
    fn publish(&mut self, class: Arc<Class>) {
        tracing::debug!(class = %class.name, id = class.id.0, size = class.instance_size, "defined class");
        self.by_name.insert(class.name.clone(), class.id);
        self.classes.push(class);
    }
}

/// Classes laid out against a [`ClassTable`] but not yet defined in it.
#[derive(Debug)]
pub struct StagedClasses {
    base: usize,
    classes: Vec<Arc<Class>>,
}

impl StagedClasses {
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Build the class that would get the next id after `tables` and `staged`.
fn build_class(
    tables: &Tables,
    staged: &[Arc<Class>],
    name: &str,
    super_name: Option<&str>,
    is_abstract: bool,
    decls: &[FieldDecl],
) -> Result<Class> {
    let find = |name: &str| -> Option<&Arc<Class>> {
        staged
            .iter()
            .find(|c| c.name == name)
            .or_else(|| tables.by_name.get(name).map(|id| &tables.classes[id.0 as usize]))
    };
    if find(name).is_some() {
        return Err(RuntimeError::DuplicateClass(name.to_string()));
    }

    let id = ClassId((tables.classes.len() + staged.len()) as u32);
    let super_class = match super_name {
        Some(super_name) => Some(
            find(super_name).ok_or_else(|| RuntimeError::UnknownClass(super_name.to_string()))?,
        ),
        None if id.0 == 0 => None,
        None => Some(&tables.classes[well_known::OBJECT.0 as usize]),
    };

    let (mut fields, base_size, depth) = match super_class {
        Some(sup) => (sup.fields.clone(), sup.instance_size, sup.depth + 1),
        None => (Vec::new(), OBJECT_HEADER_SIZE, 0),
    };

    for (i, decl) in decls.iter().enumerate() {
        if decls[..i].iter().any(|d| d.name == decl.name) {
            return Err(RuntimeError::InvalidProgram(format!(
                "duplicate field `{}` in {}",
                decl.name, name
            )));
        }
    }
    let (own, instance_size) = layout_fields(id, base_size, decls)?;
    fields.extend(own);

    let reference_offsets: Arc<[u16]> = fields
        .iter()
        .filter(|f| f.kind.is_reference())
        .map(|f| f.offset)
        .collect();

    Ok(Class {
        id,
        name: name.to_string(),
        super_class: super_class.map(|sup| sup.id),
        is_abstract,
        fields,
        instance_size,
        reference_offsets,
        depth,
    })
}

/// Append-only registry of classes.
#[derive(Debug)]
pub struct ClassTable {
    tables: RwLock<Tables>,
}

impl ClassTable {
    /// A table holding the built-in classes.
    pub fn new() -> Self {
        let table = Self {
            tables: RwLock::new(Tables::default()),
        };
        for (name, super_class) in well_known::BUILTINS {
            let super_name = super_class.map(|id| well_known::BUILTINS[id.0 as usize].0);
            if let Err(e) = table.define(name, super_name, false, &[]) {
                crate::fatal!("failed to define built-in class {}: {}", name, e);
            }
        }
        table
    }

    /// Define a class. The superclass must already be defined; `None`
    /// means `java.lang.Object` (or no superclass for Object itself).
    pub fn define(
        &self,
        name: &str,
        super_name: Option<&str>,
        is_abstract: bool,
        decls: &[FieldDecl],
    ) -> Result<ClassId> {
        let mut tables = self.tables.write();
        let class = build_class(&tables, &[], name, super_name, is_abstract, decls)?;
        let id = class.id;
        tables.publish(Arc::new(class));
        Ok(id)
    }

    /// Lay out a program's classes without making them visible. Nothing
    /// is defined unless the result is passed to [`ClassTable::commit`].
    pub fn stage(&self, specs: &[ClassSpec]) -> Result<StagedClasses> {
        let tables = self.tables.read();
        let mut staged = StagedClasses {
            base: tables.classes.len(),
            classes: Vec::with_capacity(specs.len()),
        };
        for spec in specs {
            let decls: Vec<FieldDecl> = spec
                .fields
                .iter()
                .map(|f| FieldDecl {
                    name: f.name.clone(),
                    kind: f.kind,
                })
                .collect();
            let class = build_class(
                &tables,
                &staged.classes,
                &spec.name,
                spec.super_class.as_deref(),
                spec.is_abstract,
                &decls,
            )?;
            staged.classes.push(Arc::new(class));
        }
        Ok(staged)
    }

    /// Publish staged classes. Fails if the table changed since staging,
    /// since the staged ids would no longer be the next free ones.
    pub fn commit(&self, staged: StagedClasses) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.classes.len() != staged.base {
            return Err(RuntimeError::InvalidProgram(
                "classes were defined while the program was loading".to_string(),
            ));
        }
        for class in staged.classes {
            tables.publish(class);
        }
        Ok(())
    }

    /// Look `name` up among staged classes first, then defined ones.
    pub fn lookup_staged(&self, staged: &StagedClasses, name: &str) -> Option<Arc<Class>> {
        staged
            .classes
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .or_else(|| self.lookup(name))
    }

    pub fn get(&self, id: ClassId) -> Arc<Class> {
        match self.tables.read().classes.get(id.0 as usize) {
            Some(class) => Arc::clone(class),
            None => crate::fatal!("unknown class id {}", id.0),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Class>> {
        let tables = self.tables.read();
        let id = tables.by_name.get(name)?;
        Some(Arc::clone(&tables.classes[id.0 as usize]))
    }

    pub fn name_of(&self, id: ClassId) -> String {
        self.get(id).name.clone()
    }

    /// Whether `sub` is `sup` or one of its subclasses.
    pub fn is_subclass_of(&self, sub: ClassId, sup: ClassId) -> bool {
        let tables = self.tables.read();
        let target_depth = tables.classes[sup.0 as usize].depth;
        let mut current = &tables.classes[sub.0 as usize];
        while current.depth > target_depth {
            match current.super_class {
                Some(parent) => current = &tables.classes[parent.0 as usize],
                None => return false,
            }
        }
        current.id == sup
    }

    pub fn is_throwable(&self, id: ClassId) -> bool {
        self.is_subclass_of(id, well_known::THROWABLE)
    }

    pub fn len(&self) -> usize {
        self.tables.read().classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}
