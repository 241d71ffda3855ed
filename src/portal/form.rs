use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::error::{PortalError, PortalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormMethod {
    Get,
    Post,
}

/// A single successful control of a form, as a browser would submit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub value: String,
    /// Lowercased `type` attribute for inputs, or the tag name for `select`/`textarea`.
    pub kind: String,
}

impl FormField {
    fn is_text_like(&self) -> bool {
        matches!(self.kind.as_str(), "text" | "email" | "tel" | "number")
    }
}

/// An HTML form lifted out of a fetched page: where it posts, how, and the
/// name/value pairs it would send untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form {
    name: String,
    action: Url,
    method: FormMethod,
    fields: Vec<FormField>,
}

impl Form {
    /// Locates the `<form name="...">` element in `html` and collects its controls.
    /// Relative `action`s resolve against `page_url`.
    pub fn find(html: &str, page_url: &Url, name: &str) -> PortalResult<Self> {
        let document = Html::parse_document(html);
        let form_sel = selector("form");

        let element = document
            .select(&form_sel)
            .find(|form| form.value().attr("name") == Some(name))
            .ok_or_else(|| PortalError::FormNotFound {
                form: name.to_string(),
                url: page_url.to_string(),
            })?;

        let action = match element.value().attr("action").map(str::trim) {
            Some(action) if !action.is_empty() => page_url.join(action)?,
            _ => page_url.clone(),
        };

        let method = match element.value().attr("method") {
            Some(method) if method.eq_ignore_ascii_case("post") => FormMethod::Post,
            _ => FormMethod::Get,
        };

        Ok(Self {
            name: name.to_string(),
            action,
            method,
            fields: collect_fields(element),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &Url {
        &self.action
    }

    pub fn method(&self) -> FormMethod {
        self.method
    }

    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }

    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.value.as_str())
    }

    /// Overwrites an existing control's value. Unknown names are an error: the
    /// portal would silently ignore a field we invented.
    pub fn set(&mut self, field: &str, value: &str) -> PortalResult<()> {
        let slot = self
            .fields
            .iter_mut()
            .find(|f| f.name == field)
            .ok_or_else(|| PortalError::FieldNotFound {
                form: self.name.clone(),
                field: field.to_string(),
            })?;
        slot.value = value.to_string();
        Ok(())
    }

    pub fn password_field(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.kind == "password")
            .map(|f| f.name.as_str())
    }

    /// Prefers a control literally called `username`, then the first visible
    /// text-like input.
    pub fn username_field(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == "username" && f.kind != "hidden")
            .or_else(|| self.fields.iter().find(|f| f.is_text_like()))
            .map(|f| f.name.as_str())
    }

    pub fn pairs(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.value.clone()))
            .collect()
    }
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

fn collect_fields(form: ElementRef<'_>) -> Vec<FormField> {
    let control_sel = selector("input, select, textarea");
    let option_sel = selector("option");
    let mut fields = Vec::new();

    for control in form.select(&control_sel) {
        let element = control.value();
        let name = match element.attr("name") {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => continue,
        };
        if element.attr("disabled").is_some() {
            continue;
        }

        match element.name() {
            "select" => {
                let options: Vec<ElementRef<'_>> = control.select(&option_sel).collect();
                let selected: Vec<&ElementRef<'_>> = options
                    .iter()
                    .filter(|o| o.value().attr("selected").is_some())
                    .collect();
                let chosen = if selected.is_empty() {
                    options.first().into_iter().collect()
                } else {
                    selected
                };
                for option in chosen {
                    fields.push(FormField {
                        name: name.clone(),
                        value: option_value(option),
                        kind: "select".to_string(),
                    });
                }
            }
            "textarea" => fields.push(FormField {
                name,
                value: control.text().collect(),
                kind: "textarea".to_string(),
            }),
            _ => {
                let kind = element.attr("type").unwrap_or("text").to_ascii_lowercase();
                if matches!(
                    kind.as_str(),
                    "submit" | "button" | "image" | "reset" | "file"
                ) {
                    continue;
                }
                if (kind == "checkbox" || kind == "radio") && element.attr("checked").is_none() {
                    continue;
                }
                let default = if kind == "checkbox" || kind == "radio" {
                    "on"
                } else {
                    ""
                };
                fields.push(FormField {
                    name,
                    value: element.attr("value").unwrap_or(default).to_string(),
                    kind,
                });
            }
        }
    }

    fields
}

fn option_value(option: &ElementRef<'_>) -> String {
    match option.value().attr("value") {
        Some(value) => value.to_string(),
        None => option.text().collect::<String>().trim().to_string(),
    }
}
