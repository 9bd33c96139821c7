mod article;
mod tag;

pub use article::{Article, NewArticle};
pub use tag::{NewTag, Tag, TagCandidate, TagCriteria};
