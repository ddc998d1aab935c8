//! Builder for a single eager operation.

use std::sync::Arc;

use crate::device::name::ParsedName;
use crate::eager::attr::{AttrMap, AttrValue};
use crate::eager::context::Context;
use crate::eager::kernels::Kernel;
use crate::eager::tensor_handle::TensorHandle;
use crate::status::{Status, StatusResult};
use crate::tensor::{DType, PartialShape, Tensor};

pub struct Op {
    context: Arc<Context>,
    name: String,
    device: Option<String>,
    inputs: Vec<TensorHandle>,
    attrs: AttrMap,
}

impl Op {
    /// Fails with NotFound when `name` is neither a registered kernel nor a library function.
    pub fn new(context: &Arc<Context>, name: &str) -> StatusResult<Self> {
        if context.find_kernel(name).is_none() {
            return Err(Status::not_found(format!("Op type not registered '{name}'")));
        }
        Ok(Op {
            context: Arc::clone(context),
            name: name.to_string(),
            device: None,
            inputs: Vec::new(),
            attrs: AttrMap::new(),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requested device, or `None` to let placement decide. An empty name clears it.
    pub fn set_device(&mut self, name: &str) -> StatusResult<()> {
        if name.is_empty() {
            self.device = None;
            return Ok(());
        }
        ParsedName::parse(name)?;
        self.device = Some(name.to_string());
        Ok(())
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn add_input(&mut self, input: &TensorHandle) -> StatusResult<()> {
        if input.context_id() != self.context.id() {
            return Err(Status::invalid_argument(format!(
                "input {} of {} was produced by a different context",
                self.inputs.len(),
                self.name
            )));
        }
        self.inputs.push(input.clone());
        Ok(())
    }

    pub fn inputs(&self) -> &[TensorHandle] {
        &self.inputs
    }

    pub(crate) fn kernel(&self) -> StatusResult<Kernel> {
        self.context
            .find_kernel(&self.name)
            .ok_or_else(|| Status::not_found(format!("Op type not registered '{}'", self.name)))
    }

    /// Output types for the current inputs and attributes, without running anything.
    pub fn output_types(&self) -> StatusResult<Vec<DType>> {
        let input_types: Vec<DType> = self.inputs.iter().map(TensorHandle::dtype).collect();
        self.kernel()?.output_types(&self.attrs, &input_types)
    }

    pub fn attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn set_attr(&mut self, name: &str, value: AttrValue) {
        self.attrs.set(name, value);
    }

    pub fn set_attr_int(&mut self, name: &str, value: i64) {
        self.set_attr(name, AttrValue::Int(value));
    }

    pub fn set_attr_float(&mut self, name: &str, value: f32) {
        self.set_attr(name, AttrValue::Float(value));
    }

    pub fn set_attr_bool(&mut self, name: &str, value: bool) {
        self.set_attr(name, AttrValue::Bool(value));
    }

    pub fn set_attr_string(&mut self, name: &str, value: impl Into<String>) {
        self.set_attr(name, AttrValue::String(value.into()));
    }

    pub fn set_attr_type(&mut self, name: &str, value: DType) {
        self.set_attr(name, AttrValue::Type(value));
    }

    pub fn set_attr_shape(&mut self, name: &str, value: PartialShape) {
        self.set_attr(name, AttrValue::Shape(value));
    }

    pub fn set_attr_tensor(&mut self, name: &str, value: Tensor) {
        self.set_attr(name, AttrValue::Tensor(value));
    }

    pub fn set_attr_function_name(&mut self, name: &str, function: impl Into<String>) {
        self.set_attr(name, AttrValue::Func(function.into()));
    }

    pub fn set_attr_list(&mut self, name: &str, values: Vec<AttrValue>) {
        self.set_attr(name, AttrValue::List(values));
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Op")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("inputs", &self.inputs.len())
            .field("attrs", &self.attrs)
            .finish()
    }
}
