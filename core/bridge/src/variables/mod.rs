//! The tree of inspectable variables.
//!
//! Remote values arrive one evaluate round trip at a time. They are turned
//! into [`VariableNode`]s held in [`VariablesContainer`]s, which are addressed
//! by the integer reference the editor uses to ask for children. Object
//! members are fetched only when the editor expands the object.

mod value;

pub use value::{
    ArrayKey, COLLAPSED_MARKER, FUNCTION_DESCRIPTOR, UNDEFINED_SENTINEL, ValueShape,
    cantor_pairing, classify, name_hash,
};

use std::future::Future;

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

use crate::{error::VariablesError, logging::Logger, remote::ContextId};

/// Handle the editor uses to fetch the children of a node; `0` for leaves.
pub type VariablesReference = u64;

/// Evaluates expressions in a remote context on behalf of the variables graph.
pub trait Evaluator {
    /// Evaluates `expression` in `context_id` and returns the raw value.
    fn evaluate(
        &self,
        context_id: ContextId,
        expression: &str,
    ) -> impl Future<Output = Result<Value, VariablesError>> + Send;
}

/// One inspectable variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableNode {
    /// Display name.
    pub name: String,
    /// Expression that yields this value in the remote context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluate_name: Option<String>,
    /// Declared type.
    #[serde(rename = "type")]
    pub type_: String,
    /// Display value.
    pub value: String,
    /// Reference of the children container, `0` for leaves.
    pub variables_reference: VariablesReference,
}

impl VariableNode {
    fn leaf(name: &str, evaluate_name: Option<&str>, type_: &str, value: String) -> Self {
        Self {
            name: name.to_owned(),
            evaluate_name: evaluate_name.map(str::to_owned),
            type_: type_.to_owned(),
            value,
            variables_reference: 0,
        }
    }
}

/// The children of one scope, object or array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariablesContainer {
    /// Context the values live in.
    pub context_id: ContextId,
    /// Reference of the frame scope this container descends from.
    pub scope: VariablesReference,
    /// Reference the object was created under; set for lazily populated objects.
    pub parent: Option<VariablesReference>,
    /// Display name of the object.
    pub variable_name: Option<String>,
    /// Expression yielding the object.
    pub evaluate_name: Option<String>,
    /// Whether the members were fetched.
    pub populated: bool,
    /// The children, in display order.
    pub variables: Vec<VariableNode>,
}

impl VariablesContainer {
    fn new(context_id: ContextId, scope: VariablesReference) -> Self {
        Self {
            context_id,
            scope,
            parent: None,
            variable_name: None,
            evaluate_name: None,
            populated: true,
            variables: Vec::new(),
        }
    }

    fn needs_population(&self) -> bool {
        !self.populated && self.parent.is_some() && self.variable_name.is_some()
    }
}

/// Derives the reference of a composite value from its scope and expression.
///
/// The result is rounded to the nearest `f64` so editors that parse protocol
/// numbers as doubles echo it back unchanged. Two expressions may collide.
pub fn create_reference(
    scope: VariablesReference,
    expression: &str,
) -> Result<VariablesReference, VariablesError> {
    if expression.is_empty() {
        return Err(VariablesError::EmptyName);
    }
    let paired = cantor_pairing(scope, u64::from(name_hash(expression)));
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let reference = paired as f64 as u64;
    Ok(reference)
}

/// Remote expression that serializes `expression`, preferring the server's JSON helper.
pub fn population_expression(helper: &str, expression: &str) -> String {
    format!(
        "try {{ JSON.stringify(require(\"{helper}\")({expression})); }} \
         catch (err) {{ JSON.stringify({expression}); }}"
    )
}

/// Arena of variables containers keyed by reference.
#[derive(Debug)]
pub struct VariablesMap {
    containers: FxHashMap<VariablesReference, VariablesContainer>,
    json_helper: String,
    log: Logger,
}

impl VariablesMap {
    /// Creates an empty map; objects are serialized through `json_helper` when the server has it.
    pub fn new(json_helper: impl Into<String>, log: Logger) -> Self {
        Self {
            containers: FxHashMap::default(),
            json_helper: json_helper.into(),
            log,
        }
    }

    /// Drops every container.
    pub fn clear(&mut self) {
        self.containers.clear();
    }

    /// The container registered under `reference`.
    pub fn container(
        &self,
        reference: VariablesReference,
    ) -> Result<&VariablesContainer, VariablesError> {
        self.containers
            .get(&reference)
            .ok_or(VariablesError::UnknownReference(reference))
    }

    /// Registers an empty scope root for `context_id` at `reference`.
    pub fn create_scope(&mut self, reference: VariablesReference, context_id: ContextId) {
        self.containers
            .insert(reference, VariablesContainer::new(context_id, reference));
    }

    /// Materializes a variable into the container at `reference`, replacing a variable of the same name.
    ///
    /// A missing container is created as a scope root for `context_id`.
    pub fn create_variable(
        &mut self,
        name: &str,
        value: &Value,
        context_id: ContextId,
        reference: VariablesReference,
        evaluate_name: Option<&str>,
    ) -> Result<(), VariablesError> {
        let scope = self
            .containers
            .get(&reference)
            .map_or(reference, |container| container.scope);
        let evaluate_name = evaluate_name.filter(|e| !e.is_empty()).unwrap_or(name);
        let node = self.materialize(name, value, context_id, scope, evaluate_name)?;

        let container = self
            .containers
            .entry(reference)
            .or_insert_with(|| VariablesContainer::new(context_id, reference));
        match container.variables.iter_mut().find(|v| v.name == node.name) {
            Some(existing) => *existing = node,
            None => container.variables.push(node),
        }
        Ok(())
    }

    /// Turns one raw value into a node, registering containers for composite values.
    fn materialize(
        &mut self,
        name: &str,
        value: &Value,
        context_id: ContextId,
        scope: VariablesReference,
        evaluate_name: &str,
    ) -> Result<VariableNode, VariablesError> {
        if name.is_empty() {
            return Err(VariablesError::EmptyName);
        }

        match classify(value) {
            ValueShape::Undefined => Ok(VariableNode::leaf(
                name,
                None,
                "undefined",
                "undefined".to_owned(),
            )),
            ValueShape::Primitive { value, type_ } => {
                Ok(VariableNode::leaf(name, Some(evaluate_name), type_, value))
            }
            ValueShape::FunctionDescriptor { parameters } => Ok(VariableNode::leaf(
                name,
                Some(evaluate_name),
                "string",
                format!("function ({parameters}) {{ ... }}"),
            )),
            ValueShape::Array(entries) => {
                let mut container = VariablesContainer::new(context_id, scope);
                container.evaluate_name = Some(evaluate_name.to_owned());
                for (key, element) in entries {
                    let (element_name, element_expression) = match key {
                        ArrayKey::Length => ("length".to_owned(), format!("{evaluate_name}.length")),
                        ArrayKey::Index(index) => {
                            (index.to_string(), format!("{evaluate_name}[{index}]"))
                        }
                    };
                    container.variables.push(self.materialize(
                        &element_name,
                        element,
                        context_id,
                        scope,
                        &element_expression,
                    )?);
                }

                let reference = create_reference(scope, evaluate_name)?;
                self.containers.insert(reference, container);
                Ok(VariableNode {
                    name: name.to_owned(),
                    evaluate_name: Some(evaluate_name.to_owned()),
                    type_: "array".to_owned(),
                    value: "[Array]".to_owned(),
                    variables_reference: reference,
                })
            }
            ValueShape::Object => {
                let mut container = VariablesContainer::new(context_id, scope);
                container.parent = Some(scope);
                container.variable_name = Some(name.to_owned());
                container.evaluate_name = Some(evaluate_name.to_owned());
                container.populated = false;

                let reference = create_reference(scope, evaluate_name)?;
                self.containers.insert(reference, container);
                Ok(VariableNode {
                    name: name.to_owned(),
                    evaluate_name: Some(evaluate_name.to_owned()),
                    type_: "object".to_owned(),
                    value: "Object".to_owned(),
                    variables_reference: reference,
                })
            }
        }
    }

    /// Materializes the members of `value`, each reachable as `expression.key`.
    fn members(
        &mut self,
        value: &Value,
        context_id: ContextId,
        scope: VariablesReference,
        expression: &str,
    ) -> Result<Vec<VariableNode>, VariablesError> {
        match value {
            Value::Object(members) => members
                .iter()
                .map(|(key, member)| {
                    self.materialize(key, member, context_id, scope, &format!("{expression}.{key}"))
                })
                .collect(),
            Value::Array(elements) => elements
                .iter()
                .enumerate()
                .map(|(index, element)| {
                    self.materialize(
                        &index.to_string(),
                        element,
                        context_id,
                        scope,
                        &format!("{expression}[{index}]"),
                    )
                })
                .collect(),
            _ => Ok(Vec::new()),
        }
    }

    async fn evaluate_object<E: Evaluator>(
        &self,
        evaluator: &E,
        context_id: ContextId,
        expression: &str,
    ) -> Result<Value, VariablesError> {
        let raw = evaluator
            .evaluate(context_id, &population_expression(&self.json_helper, expression))
            .await?;
        match raw {
            Value::String(json) => {
                serde_json::from_str(&json).map_err(|err| VariablesError::Evaluate {
                    expression: expression.to_owned(),
                    reason: err.to_string(),
                })
            }
            other => Ok(other),
        }
    }

    /// Returns the children at `reference`, fetching object members and expanding
    /// collapsed placeholders first.
    pub async fn variables<E: Evaluator>(
        &mut self,
        reference: VariablesReference,
        evaluator: &E,
    ) -> Result<Vec<VariableNode>, VariablesError> {
        let container = self.container(reference)?;
        if container.needs_population() {
            self.populate(reference, evaluator).await?;
        }
        self.expand_collapsed(reference, evaluator).await?;
        Ok(self.container(reference)?.variables.clone())
    }

    async fn populate<E: Evaluator>(
        &mut self,
        reference: VariablesReference,
        evaluator: &E,
    ) -> Result<(), VariablesError> {
        let container = self.container(reference)?;
        let (context_id, scope) = (container.context_id, container.scope);
        let Some(expression) = container
            .evaluate_name
            .clone()
            .or_else(|| container.variable_name.clone())
        else {
            return Ok(());
        };
        self.log.debug(format_args!(
            "populating {expression} under scope {scope}"
        ));

        let value = self.evaluate_object(evaluator, context_id, &expression).await?;
        let members = self.members(&value, context_id, scope, &expression)?;

        let container = self
            .containers
            .get_mut(&reference)
            .ok_or(VariablesError::UnknownReference(reference))?;
        container.variables.extend(members);
        container.populated = true;
        Ok(())
    }

    /// Replaces collapsed placeholders at `reference` with the evaluated parent value.
    ///
    /// Placeholders are handled one at a time and the container is re-read
    /// after each, since expanding one rewrites the container.
    pub async fn expand_collapsed<E: Evaluator>(
        &mut self,
        reference: VariablesReference,
        evaluator: &E,
    ) -> Result<(), VariablesError> {
        let markers = self
            .container(reference)?
            .variables
            .iter()
            .filter(|v| v.name == COLLAPSED_MARKER)
            .count();

        for _ in 0..markers {
            let container = self.container(reference)?;
            let (context_id, scope) = (container.context_id, container.scope);
            let Some(marker) = container
                .variables
                .iter()
                .find(|v| v.name == COLLAPSED_MARKER)
            else {
                break;
            };
            let evaluate_name = marker
                .evaluate_name
                .clone()
                .filter(|e| !e.is_empty())
                .ok_or_else(|| VariablesError::NoEvaluateName(marker.name.clone()))?;
            let parent_expression = evaluate_name.replace(&format!(".{COLLAPSED_MARKER}"), "");
            self.log.debug(format_args!("expanding collapsed {parent_expression}"));

            let value = self
                .evaluate_object(evaluator, context_id, &parent_expression)
                .await?;

            let composite = matches!(
                classify(&value),
                ValueShape::Array(_) | ValueShape::Object
            );
            if composite {
                let members = self.members(&value, context_id, scope, &parent_expression)?;
                let container = self
                    .containers
                    .get_mut(&reference)
                    .ok_or(VariablesError::UnknownReference(reference))?;
                container.variables = members;
                container.populated = true;
            } else {
                let name = parent_expression
                    .rsplit_once('.')
                    .map_or(parent_expression.as_str(), |(_, last)| last)
                    .to_owned();
                let node = self.materialize(&name, &value, context_id, scope, &parent_expression)?;
                let container = self
                    .containers
                    .get_mut(&reference)
                    .ok_or(VariablesError::UnknownReference(reference))?;
                if let Some(slot) = container
                    .variables
                    .iter_mut()
                    .find(|v| v.name == COLLAPSED_MARKER)
                {
                    *slot = node;
                }
            }
        }
        Ok(())
    }

    /// The single variable named `name` at `reference`.
    pub fn unique_variable(
        &self,
        reference: VariablesReference,
        name: &str,
    ) -> Result<&VariableNode, VariablesError> {
        let container = self.container(reference)?;
        let mut matches = container.variables.iter().filter(|v| v.name == name);
        match (matches.next(), matches.count()) {
            (Some(variable), 0) => Ok(variable),
            (first, rest) => Err(VariablesError::NotUnique {
                reference,
                name: name.to_owned(),
                count: usize::from(first.is_some()) + rest,
            }),
        }
    }

    /// Updates the displayed value of the variable named `name` at `reference`.
    pub fn set_display_value(
        &mut self,
        reference: VariablesReference,
        name: &str,
        value: &str,
    ) -> Result<VariableNode, VariablesError> {
        self.unique_variable(reference, name)?;
        let container = self
            .containers
            .get_mut(&reference)
            .ok_or(VariablesError::UnknownReference(reference))?;
        let variable = container
            .variables
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or(VariablesError::UnknownReference(reference))?;
        variable.value = value.to_owned();
        Ok(variable.clone())
    }
}
