// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Value change dumps of link state, one timestamp per simulated cycle.

use bitvec::prelude::*;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;

pub const DEFAULT_TOP_MODULE: &str = "link";
const DEFAULT_VCD_HEADER: &str = "pcie link VCD";
const CYCLE_VAR: &str = "sim_cycles";

#[derive(Clone, PartialEq)]
enum SizedData {
    Filled(BitBox<u64, Lsb0>),
    Undefined(usize),
}

#[derive(Clone, Copy)]
struct Var {
    id_code: vcd::IdCode,
    width: usize,
}

pub struct VcdWriter {
    writer: vcd::Writer<Box<dyn io::Write>>,
    is_error_state: bool,
    scope_stack: Vec<String>,
    id_map: HashMap<String, Var>,
    last_value_map: HashMap<vcd::IdCode, SizedData>,
    timestamp: u64,
}

pub struct VcdTraceScope {
    writer: Rc<RefCell<VcdWriter>>,
    scope: String,
}

impl Drop for VcdTraceScope {
    fn drop(&mut self) {
        self.writer.borrow_mut().leave_scope(self.scope.as_str());
    }
}

pub struct VcdDeclScope {
    writer: Rc<RefCell<VcdWriter>>,
    scope: String,
}

impl Drop for VcdDeclScope {
    fn drop(&mut self) {
        self.writer.borrow_mut().upscope(self.scope.as_str());
    }
}

fn pack(value: u64, width: usize) -> BitBox<u64, Lsb0> {
    value.view_bits::<Lsb0>()[..width.min(64)]
        .to_bitvec()
        .into_boxed_bitslice()
}

impl VcdWriter {
    pub fn new(dst: Box<dyn io::Write>) -> Self {
        Self {
            writer: vcd::Writer::new(dst),
            is_error_state: false,
            scope_stack: vec![],
            id_map: HashMap::new(),
            last_value_map: HashMap::new(),
            timestamp: 0,
        }
    }

    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = fs::File::create(path.as_ref())?;
        log::debug!("VCD file: {}", path.as_ref().display());
        Ok(Self::new(Box::new(io::BufWriter::new(file))))
    }

    /// True once writing failed; nothing is written afterwards.
    pub fn is_error_state(&self) -> bool {
        self.is_error_state
    }

    fn vcd_error_handler(&mut self, err: io::Error) {
        if !self.is_error_state {
            self.is_error_state = true;
            log::error!("VCD writing failed with error {:?}", err)
        }
    }

    pub fn managed_decl_scope<T>(writer: Rc<RefCell<VcdWriter>>, scope: &T) -> VcdDeclScope
    where
        T: Display + ?Sized,
    {
        writer.borrow_mut().add_module(scope);
        VcdDeclScope {
            writer: Rc::clone(&writer),
            scope: scope.to_string(),
        }
    }

    pub fn managed_trace_scope<T>(writer: Rc<RefCell<VcdWriter>>, scope: &T) -> VcdTraceScope
    where
        T: Display + ?Sized,
    {
        writer.borrow_mut().enter_scope(scope);
        VcdTraceScope {
            writer: Rc::clone(&writer),
            scope: scope.to_string(),
        }
    }

    fn preamble(&mut self) {
        if self.is_error_state {
            return;
        }
        let date = chrono::Utc::now().to_string();
        self.writer
            .comment(DEFAULT_VCD_HEADER)
            .and_then(|_| self.writer.date(date.as_str()))
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn end_definitions(&mut self) {
        if self.is_error_state {
            return;
        }
        self.writer
            .enddefinitions()
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    /// Declare the signals of `components` and record their initial values
    /// at timestamp 0.
    pub fn write_header(writer: Rc<RefCell<Self>>, components: &[&dyn VcdComponent]) {
        writer.borrow_mut().preamble();
        {
            let _vcd_decl_scope =
                VcdWriter::managed_decl_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
            writer.borrow_mut().add_integer_var::<u64>(CYCLE_VAR);
            for component in components {
                component.vcd_write_scope(Rc::clone(&writer));
            }
        }
        writer.borrow_mut().end_definitions();
        {
            let _vcd_trace_scope =
                VcdWriter::managed_trace_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
            writer.borrow_mut().enter_cycle();
            writer.borrow_mut().change_vector(CYCLE_VAR, 0);
            for component in components {
                component.vcd_init(Rc::clone(&writer));
            }
            writer.borrow_mut().end_cycle();
        }
    }

    /// Record the values of `components` after simulated cycle `cycle`.
    pub fn write_cycle(writer: Rc<RefCell<Self>>, cycle: u64, components: &[&dyn VcdComponent]) {
        if writer.borrow().is_error_state {
            return;
        }
        let _vcd_trace_scope = VcdWriter::managed_trace_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
        writer.borrow_mut().enter_cycle();
        writer.borrow_mut().change_vector(CYCLE_VAR, cycle);
        for component in components {
            component.vcd_record(Rc::clone(&writer));
        }
        writer.borrow_mut().end_cycle();
    }

    fn enter_scope<T: Display + ?Sized>(&mut self, name: &T) {
        self.scope_stack.push(name.to_string())
    }

    fn record_change(&mut self, id_code: vcd::IdCode, sized_data: SizedData) {
        if self.is_error_state {
            return;
        }
        self._record_change(id_code, sized_data)
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn _record_change(&mut self, id_code: vcd::IdCode, sized_data: SizedData) -> io::Result<()> {
        if self.last_value_map.get(&id_code) == Some(&sized_data) {
            return Ok(());
        }
        let values = match &sized_data {
            SizedData::Filled(data) => data
                .iter()
                .rev()
                .map(|b| (*b).into())
                .collect::<Vec<vcd::Value>>(),
            SizedData::Undefined(size) => vec![vcd::Value::X; *size],
        };
        self.writer.change_vector(id_code, values.as_slice())?;
        self.last_value_map.insert(id_code, sized_data);
        Ok(())
    }

    /// Set the signal `name` in the current scope.
    pub fn change_vector(&mut self, name: &str, value: u64) {
        if let Some(var) = self.lookup_var(name) {
            if cfg!(feature = "trace-echo-vcd-signal-changes") {
                log::trace!("VCD changing {} to {:#x}", self.scoped_name(name), value);
            }
            self.record_change(var.id_code, SizedData::Filled(pack(value, var.width)));
        }
    }

    /// Mark the signal `name` in the current scope as undefined.
    pub fn change_undefined(&mut self, name: &str) {
        if let Some(var) = self.lookup_var(name) {
            if cfg!(feature = "trace-echo-vcd-signal-changes") {
                log::trace!("VCD changing {} to x", self.scoped_name(name));
            }
            self.record_change(var.id_code, SizedData::Undefined(var.width));
        }
    }

    fn lookup_var(&self, name: &str) -> Option<Var> {
        let scoped_name = self.scoped_name(name);
        let var = self.id_map.get(scoped_name.as_str()).copied();
        if var.is_none() {
            log::warn!(
                "No such scoped name {} was defined for VCD dumps.",
                scoped_name
            );
        }
        var
    }

    fn enter_cycle(&mut self) {
        if self.is_error_state {
            return;
        }
        self.writer
            .timestamp(self.timestamp)
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn end_cycle(&mut self) {
        self.timestamp += 1;
    }

    fn leave_scope<T: Display + ?Sized>(&mut self, scope: &T) {
        match self.scope_stack.pop() {
            Some(popped) if popped == scope.to_string() => {}
            popped => log::warn!("VCD scope {:?} left while in {:?}", scope.to_string(), popped),
        }
    }

    fn add_module<T: Display + ?Sized>(&mut self, name: &T) {
        self.scope_stack.push(name.to_string());
        if self.is_error_state {
            return;
        }
        self.writer
            .add_module(&name.to_string())
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn upscope<T: Display + ?Sized>(&mut self, scope: &T) {
        self.leave_scope(scope);
        if self.is_error_state {
            return;
        }
        self.writer
            .upscope()
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    /// Declare an integer signal as wide as `T`.
    pub fn add_integer_var<T: Sized>(&mut self, reference: &str) {
        if self.is_error_state {
            return;
        }
        self._add_integer_var::<T>(reference)
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn _add_integer_var<T: Sized>(&mut self, reference: &str) -> io::Result<()> {
        let width = std::mem::size_of::<T>() * 8;
        let id_code = self
            .writer
            .add_var(vcd::VarType::Integer, width as u32, reference, None)?;
        self.add_id_map(reference, Var { id_code, width });
        Ok(())
    }

    fn scoped_name(&self, name: &str) -> String {
        self.scope_stack.join(".") + "." + name
    }

    fn add_id_map(&mut self, name: &str, var: Var) {
        let scoped_name = self.scoped_name(name);
        if self.id_map.contains_key(scoped_name.as_str()) {
            log::warn!(
                "Scoped name {} is was redefined for VCD dumps.",
                scoped_name
            );
        }
        self.id_map.insert(scoped_name, var);
    }
}

/// An object implementing `VcdComponent` declares, initializes and records
/// the signals it wants traced, within its own scope.
pub trait VcdComponent {
    /// Declare the traced signals in the VCD header.
    fn vcd_write_scope(&self, vcd_writer: Rc<RefCell<VcdWriter>>);

    /// Record the values of the signals for the current cycle.
    fn vcd_record(&self, vcd_writer: Rc<RefCell<VcdWriter>>);

    /// Record the values before the first cycle.
    fn vcd_init(&self, vcd_writer: Rc<RefCell<VcdWriter>>) {
        self.vcd_record(vcd_writer);
    }
}
