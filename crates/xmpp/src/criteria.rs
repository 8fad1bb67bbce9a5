use minidom::Element;

/// Structural predicate over an element, used by modules to claim stanzas and
/// by the response manager to wait for nonzas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criteria {
    Element {
        /// Accepted element names; empty matches any name.
        names: Vec<String>,
        xmlns: Option<String>,
        children: Vec<Criteria>,
    },
    Or(Vec<Criteria>),
}

impl Criteria {
    pub fn name(name: &str) -> Self {
        Self::names(&[name])
    }

    pub fn names(names: &[&str]) -> Self {
        Criteria::Element {
            names: names.iter().map(|n| n.to_string()).collect(),
            xmlns: None,
            children: Vec::new(),
        }
    }

    pub fn any() -> Self {
        Self::names(&[])
    }

    pub fn or(criteria: Vec<Criteria>) -> Self {
        Criteria::Or(criteria)
    }

    pub fn xmlns(self, xmlns: &str) -> Self {
        match self {
            Criteria::Element {
                names, children, ..
            } => Criteria::Element {
                names,
                xmlns: Some(xmlns.to_string()),
                children,
            },
            or => or,
        }
    }

    /// Require a child matching `child`. May be chained.
    pub fn with_child(self, child: Criteria) -> Self {
        match self {
            Criteria::Element {
                names,
                xmlns,
                mut children,
            } => {
                children.push(child);
                Criteria::Element {
                    names,
                    xmlns,
                    children,
                }
            }
            or => or,
        }
    }

    pub fn matches(&self, element: &Element) -> bool {
        match self {
            Criteria::Or(alternatives) => alternatives.iter().any(|c| c.matches(element)),
            Criteria::Element {
                names,
                xmlns,
                children,
            } => {
                if !names.is_empty() && !names.iter().any(|n| n == element.name()) {
                    return false;
                }
                if let Some(xmlns) = xmlns {
                    if element.ns() != *xmlns {
                        return false;
                    }
                }
                children
                    .iter()
                    .all(|criteria| element.children().any(|child| criteria.matches(child)))
            }
        }
    }
}
