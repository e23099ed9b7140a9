use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::model::TumorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    NoTumor,
    Tumor,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 2] = [TemplateKind::NoTumor, TemplateKind::Tumor];

    pub fn for_class(class: TumorClass) -> Self {
        if class.is_tumor() {
            TemplateKind::Tumor
        } else {
            TemplateKind::NoTumor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::NoTumor => "no_tumor",
            TemplateKind::Tumor => "tumor",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            TemplateKind::NoTumor => "email_no_tumor.html",
            TemplateKind::Tumor => "email_tumor.html",
        }
    }

    pub fn subject(&self) -> &'static str {
        match self {
            TemplateKind::NoTumor => "MRI Scan Result: No Tumor Detected",
            TemplateKind::Tumor => "MRI Scan Result: Tumor Detected",
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmailTemplateModel {
    pub template_type: String,
    pub subject: String,
    pub body: String,
}
