// Nodes and edges of the discovery graph.

use std::fmt;
use vantage_common::QualifiedName;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Element {
    Type(QualifiedName),
    /// An attribute slot on a model type.
    Member { owner: QualifiedName, attribute: String },
    /// `param/T` - any operation parameter of type T.
    Parameter(QualifiedName),
    Operation(QualifiedName),
    /// A concrete fact, indexed into the fact list the query graph was built from.
    TypeInstance(usize),
    ProvidedInstanceMember { instance: usize, attribute: String },
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Type(name) => write!(f, "type/{}", name),
            Element::Member { owner, attribute } => write!(f, "member/{}.{}", owner, attribute),
            Element::Parameter(name) => write!(f, "param/{}", name),
            Element::Operation(name) => write!(f, "operation/{}", name),
            Element::TypeInstance(i) => write!(f, "instance/{}", i),
            Element::ProvidedInstanceMember { instance, attribute } => {
                write!(f, "instance/{}.{}", instance, attribute)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relationship {
    HasAttribute,
    IsAttributeOf,
    RequiresParameter,
    IsParameterOn,
    Provides,
    CanPopulate,
    IsTypeOf,
    IsInstanceOf,
}

impl Relationship {
    /// Reverse links kept for introspection; search never walks them.
    pub fn is_traversable(&self) -> bool {
        !matches!(self, Relationship::IsAttributeOf | Relationship::RequiresParameter)
    }

    pub fn is_invocation(&self) -> bool {
        matches!(self, Relationship::IsParameterOn)
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Relationship::HasAttribute => "HAS_ATTRIBUTE",
            Relationship::IsAttributeOf => "IS_ATTRIBUTE_OF",
            Relationship::RequiresParameter => "REQUIRES_PARAMETER",
            Relationship::IsParameterOn => "IS_PARAMETER_ON",
            Relationship::Provides => "PROVIDES",
            Relationship::CanPopulate => "CAN_POPULATE",
            Relationship::IsTypeOf => "IS_TYPE_OF",
            Relationship::IsInstanceOf => "IS_INSTANCE_OF",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub relationship: Relationship,
    pub cost: u32,
}
