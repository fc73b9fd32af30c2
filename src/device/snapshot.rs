//! Structural UI snapshot parsing.
//!
//! The device hands us a uiautomator XML dump. We only need a flat list of
//! nodes with their text, id, description, class and bounds, so each `<node .../>`
//! tag is scanned with regexes instead of building a DOM.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::action::{Point, Target};

static NODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<node\b([^>]*?)/?>").unwrap());

static ATTR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w:-]+)\s*=\s*"([^"]*)""#).unwrap());

static BOUNDS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*(-?\d+)\s*,\s*(-?\d+)\s*\]\s*\[\s*(-?\d+)\s*,\s*(-?\d+)\s*\]").unwrap()
});

/// Screen rectangle of an element, `[left,top][right,bottom]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn parse(raw: &str) -> Option<Self> {
        let cap = BOUNDS_REGEX.captures(raw)?;
        let num = |i: usize| cap.get(i).and_then(|m| m.as_str().parse::<i32>().ok());
        Some(Self {
            left: num(1)?,
            top: num(2)?,
            right: num(3)?,
            bottom: num(4)?,
        })
    }

    pub fn has_area(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }

    pub fn center(&self) -> Point {
        let mid = |a: i32, b: i32| ((i64::from(a) + i64::from(b)) / 2) as i32;
        Point::new(mid(self.left, self.right), mid(self.top, self.bottom))
    }
}

/// One on-screen element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UiElement {
    pub text: String,
    pub resource_id: String,
    pub content_desc: String,
    pub class: String,
    pub bounds: Bounds,
    pub focused: bool,
}

impl UiElement {
    pub fn is_editable(&self) -> bool {
        self.class.contains("EditText")
    }

    /// Visible label: text, falling back to the content description.
    pub fn label(&self) -> &str {
        if self.text.is_empty() {
            &self.content_desc
        } else {
            &self.text
        }
    }

    /// Whether `id` names this element, either fully or by the part after `:id/`.
    fn id_matches(&self, id: &str) -> bool {
        if self.resource_id.is_empty() {
            return false;
        }
        self.resource_id == id
            || self
                .resource_id
                .rsplit_once(":id/")
                .is_some_and(|(_, short)| short == id)
    }
}

/// Flat view of a uiautomator dump. Only elements with a non-zero area are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiSnapshot {
    pub elements: Vec<UiElement>,
}

impl UiSnapshot {
    pub fn parse(xml: &str) -> Self {
        let mut elements = Vec::new();

        for node in NODE_REGEX.captures_iter(xml) {
            let Some(attrs) = node.get(1) else { continue };
            let mut element = UiElement {
                text: String::new(),
                resource_id: String::new(),
                content_desc: String::new(),
                class: String::new(),
                bounds: Bounds {
                    left: 0,
                    top: 0,
                    right: 0,
                    bottom: 0,
                },
                focused: false,
            };

            for attr in ATTR_REGEX.captures_iter(attrs.as_str()) {
                let value = unescape(&attr[2]);
                match &attr[1] {
                    "text" => element.text = value,
                    "resource-id" => element.resource_id = value,
                    "content-desc" => element.content_desc = value,
                    "class" => element.class = value,
                    "focused" => element.focused = value == "true",
                    "bounds" => {
                        if let Some(bounds) = Bounds::parse(&value) {
                            element.bounds = bounds;
                        }
                    }
                    _ => {}
                }
            }

            if element.bounds.has_area() {
                elements.push(element);
            }
        }

        Self { elements }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Locate the element a target refers to.
    ///
    /// Precedence: exact resource id, exact text or description (ignoring
    /// case), then substring of text or description.
    pub fn find(&self, target: &Target) -> Option<&UiElement> {
        if let Some(id) = target.id.as_deref().map(str::trim).filter(|s| !s.is_empty())
            && let Some(found) = self.elements.iter().find(|e| e.id_matches(id))
        {
            return Some(found);
        }

        let needle = target.text.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let needle = needle.to_lowercase();

        let exact = self.elements.iter().find(|e| {
            e.text.to_lowercase() == needle || e.content_desc.to_lowercase() == needle
        });
        exact.or_else(|| {
            self.elements.iter().find(|e| {
                e.text.to_lowercase().contains(&needle)
                    || e.content_desc.to_lowercase().contains(&needle)
            })
        })
    }

    pub fn first_editable(&self) -> Option<&UiElement> {
        self.elements.iter().find(|e| e.is_editable())
    }

    pub fn focused_editable(&self) -> Option<&UiElement> {
        self.elements.iter().find(|e| e.is_editable() && e.focused)
    }

    pub fn has_editable(&self) -> bool {
        self.first_editable().is_some()
    }

    /// Non-empty labels in document order.
    pub fn visible_texts(&self, limit: usize) -> Vec<&str> {
        self.elements
            .iter()
            .map(UiElement::label)
            .filter(|label| !label.trim().is_empty())
            .take(limit)
            .collect()
    }

    /// Stable textual form used for state hashing.
    pub fn normalized(&self) -> String {
        self.elements
            .iter()
            .map(|e| {
                format!(
                    "{}|{}|{}|{}|{},{},{},{}",
                    e.class,
                    e.resource_id,
                    e.text,
                    e.content_desc,
                    e.bounds.left,
                    e.bounds.top,
                    e.bounds.right,
                    e.bounds.bottom
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}
