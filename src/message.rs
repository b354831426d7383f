use serde::{Deserialize, Serialize};

/// Work item published once per object in the bucket.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ImageMessage {
    #[serde(rename = "imageUrl")]
    pub image_url: String,
}

impl ImageMessage {
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
        }
    }
}
