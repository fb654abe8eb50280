use std::borrow::Cow;

/// A `MetricLabel` made from an unowned string -- handy when you'd rather
/// make it owned than propagate lifetimes.
pub type StaticMetricLabel = MetricLabel<'static>;

#[derive(PartialOrd, Ord, PartialEq, Eq, Clone, Debug)]
pub struct MetricLabel<'a> {
    pub key: &'static str,
    pub value: Cow<'a, str>,
}

impl<'a> MetricLabel<'a> {
    pub const STATUS_CANCELED: StaticMetricLabel = MetricLabel {
        key: "status",
        value: Cow::Borrowed("canceled"),
    };
    pub const STATUS_ERROR: StaticMetricLabel = MetricLabel {
        key: "status",
        value: Cow::Borrowed("error"),
    };
    pub const STATUS_SUCCESS: StaticMetricLabel = MetricLabel {
        key: "status",
        value: Cow::Borrowed("success"),
    };

    pub fn new(key: &'static str, value: impl Into<Cow<'a, str>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub fn status(is_ok: bool) -> MetricLabel<'static> {
        if is_ok {
            Self::STATUS_SUCCESS
        } else {
            Self::STATUS_ERROR
        }
    }

    pub fn split_key_value(&self) -> (&str, &str) {
        (self.key, &self.value)
    }
}

pub const STATUS_LABEL: [&str; 1] = ["status"];
