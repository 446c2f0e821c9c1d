use async_trait::async_trait;

use crate::comparer::compare_json;
use crate::errors::ValidatorError;
use crate::protocol::{TestCase, ValidationItem};
use crate::selector::Selector;

use super::Validator;

/// Evaluates one test case: select the field, then compare.
pub struct BuiltinValidator {
    test_case: TestCase,
    name: String,
}

impl BuiltinValidator {
    pub fn new(test_case: TestCase) -> Self {
        let name = test_case.display_name();
        Self { test_case, name }
    }
}

#[async_trait]
impl Validator for BuiltinValidator {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn validate(&self, item: &ValidationItem<'_>) -> Result<(), ValidatorError> {
        let field = self.test_case.field.as_deref().unwrap_or_default();
        let Some(operator) = self.test_case.operator else {
            return Err(ValidatorError::Failed(format!(
                "test case '{}' has no operator",
                self.name
            )));
        };

        let selector = Selector::parse(field).map_err(ValidatorError::Failed)?;
        let actual = selector
            .select(item.response)
            .ok_or_else(|| ValidatorError::FieldNotFound(field.to_string()))?;

        let expected = &self.test_case.expected;
        if compare_json(operator, &actual, expected, self.test_case.kind) {
            Ok(())
        } else {
            Err(ValidatorError::Failed(format!(
                "expected {} {} {}, got {}",
                field, operator, expected, actual
            )))
        }
    }

    fn is_fatal(&self) -> bool {
        self.test_case.fatal
    }
}
