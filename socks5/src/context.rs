use std::collections::HashMap;

use bandwidth::Context;

/// 请求处理过程中传递的上下文。
///
/// 解析器、地址改写和规则都可以在上面附加键值，后续步骤能读到前面留下的值。
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    ctx: Context,
    values: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            values: HashMap::new(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn err(&self) -> bandwidth::Result<()> {
        self.ctx.err()
    }
}
