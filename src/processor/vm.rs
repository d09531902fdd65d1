//! Stack machine that runs compiled layouts against a text provider.
//!
//! One [`Reader`] owns its stacks for the duration of [`Reader::exec`]; the
//! function library and the unit cache are borrowed from the caller. A run
//! can be stopped from another thread through a [`HaltHandle`], checked
//! between instructions.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, trace};
use serde::Serialize;

use crate::document::TextProvider;
use crate::model::PageRect;

use super::bytecode::{Bytecode, Instruction, JumpTarget, SelectorDesc, SpacerIndex};
use super::content_view::ContentView;
use super::decimal::{Decimal, SCALE};
use super::error::{ReaderError, RuntimeError};
use super::functions::{CallContext, FunctionLibrary, Locale};
use super::units::LoadedUnits;
use super::value::Value;
use super::variables::{Selector, VariableMap, VariableStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderOptions {
    pub locale: Locale,
    /// Stop at the first layout that is not a finder layout.
    pub find_layout: bool,
}

/// Everything a successful run produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReaderOutput {
    pub globals: VariableMap,
    pub values: Vec<VariableMap>,
    pub warnings: Vec<String>,
    pub layouts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Halted,
}

/// Cloneable, `Send` handle that stops a running [`Reader`].
#[derive(Debug, Clone, Default)]
pub struct HaltHandle(Arc<AtomicBool>);

impl HaltHandle {
    pub fn halt(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_halted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

struct Frame {
    return_pc: usize,
    /// Stack height below the arguments of the call.
    arg_base: usize,
    wants_value: bool,
    return_value: Value,
    /// Unit entered through an import, if any.
    unit: Option<PathBuf>,
}

/// Per-run state; rebuilt by every [`Reader::exec`].
#[derive(Default)]
struct Run {
    pc: usize,
    stack: Vec<Value>,
    views: Vec<ContentView>,
    selected: Vec<Selector>,
    frames: Vec<Frame>,
    store: VariableStore,
    rect: PageRect,
    warnings: Vec<String>,
    layouts: Vec<String>,
    appended: HashMap<PathBuf, usize>,
    in_progress: HashSet<PathBuf>,
    box_name: Option<String>,
    line: Option<String>,
}

enum Flow {
    Next,
    Jump(usize),
    Import(String),
    Stop,
}

impl Run {
    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn pop_index(&mut self) -> Result<usize, RuntimeError> {
        let n = self.pop()?.as_int()?;
        usize::try_from(n).map_err(|_| RuntimeError::Conversion(format!("negative index {n}")))
    }

    fn pop_selector(&mut self) -> Result<Selector, RuntimeError> {
        self.selected.pop().ok_or(RuntimeError::NoSelection)
    }

    fn view(&mut self) -> Result<&mut ContentView, RuntimeError> {
        self.views.last_mut().ok_or(RuntimeError::NoContentView)
    }

    fn binary(
        &mut self,
        op: impl FnOnce(&Value, &Value) -> Result<Value, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        self.stack.push(op(&lhs, &rhs)?);
        Ok(())
    }

    fn compare(&mut self, accept: impl FnOnce(std::cmp::Ordering) -> bool) -> Result<(), RuntimeError> {
        self.binary(|a, b| Ok(a.compare(b).is_some_and(accept).into()))
    }

    fn select(&mut self, desc: &SelectorDesc) -> Result<(), RuntimeError> {
        let flags = desc.flags;
        let length = if flags.dyn_length {
            self.pop_index()?
        } else {
            usize::from(desc.length)
        };
        let index = if flags.dyn_index {
            self.pop_index()?
        } else {
            usize::from(desc.index)
        };
        let sel = self.store.select(desc.name.as_str(), flags.global);
        let sel = if flags.each {
            sel.each()
        } else if flags.append {
            sel.append(length)
        } else if flags.indexed {
            sel.at(index, length)
        } else {
            sel
        };
        self.selected.push(sel);
        Ok(())
    }

    fn move_box(&mut self, index: SpacerIndex) -> Result<(), RuntimeError> {
        let amount = self.pop()?.as_number()?;
        let n = amount.unbiased() as f64 / SCALE as f64;
        let rect = &mut self.rect;
        match index {
            SpacerIndex::Page => {
                let pages = i32::try_from(amount.to_int())
                    .map_err(|_| RuntimeError::Conversion(format!("page offset {amount} out of range")))?;
                rect.page = rect.page.saturating_add(pages);
            }
            SpacerIndex::X => rect.x += n,
            SpacerIndex::Y => rect.y += n,
            SpacerIndex::W => rect.w += n,
            SpacerIndex::H => rect.h += n,
            SpacerIndex::Top => {
                rect.y += n;
                rect.h -= n;
            }
            SpacerIndex::Right => rect.w += n,
            SpacerIndex::Bottom => rect.h += n,
            SpacerIndex::Left => {
                rect.x += n;
                rect.w -= n;
            }
        }
        Ok(())
    }

    fn jump(&self, target: &JumpTarget, len: usize) -> Result<Flow, RuntimeError> {
        match target {
            JumpTarget::Offset(offset) => {
                let dest = self.pc as i64 + i64::from(*offset);
                if dest < 0 || dest > len as i64 {
                    return Err(RuntimeError::BadJump(dest));
                }
                Ok(Flow::Jump(dest as usize))
            }
            JumpTarget::Label(label) => Err(RuntimeError::UnresolvedLabel(label.clone())),
        }
    }

    fn into_output(self) -> ReaderOutput {
        let (globals, values) = self.store.into_parts();
        ReaderOutput {
            globals,
            values,
            warnings: self.warnings,
            layouts: self.layouts,
        }
    }
}

fn count(n: usize) -> Value {
    Decimal::from_int(n as i64).into()
}

pub struct Reader<'a, P: TextProvider> {
    library: &'a FunctionLibrary,
    units: &'a mut LoadedUnits,
    provider: P,
    options: ReaderOptions,
    halt: HaltHandle,
    state: State,
}

impl<'a, P: TextProvider> Reader<'a, P> {
    pub fn new(
        library: &'a FunctionLibrary,
        units: &'a mut LoadedUnits,
        provider: P,
        options: ReaderOptions,
    ) -> Self {
        Self {
            library,
            units,
            provider,
            options,
            halt: HaltHandle::default(),
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn halt_handle(&self) -> HaltHandle {
        self.halt.clone()
    }

    /// Requests a stop at the next instruction boundary.
    pub fn halt(&self) {
        self.halt.halt();
    }

    /// Runs `code` from its first instruction with fresh stacks.
    pub fn exec(&mut self, code: Bytecode) -> Result<ReaderOutput, ReaderError> {
        info!("running {} instructions", code.len());
        let mut run = Run::default();
        self.state = State::Running;
        let result = self.run_loop(&mut run, code);
        self.state = State::Halted;
        match result {
            Ok(()) => {
                debug!(
                    "run finished: {} tables, {} warnings",
                    run.store.tables().len(),
                    run.warnings.len()
                );
                Ok(run.into_output())
            }
            Err(source) => Err(ReaderError {
                box_name: run.box_name.take(),
                line: run.line.take(),
                source,
            }),
        }
    }

    fn run_loop(&mut self, run: &mut Run, mut code: Bytecode) -> Result<(), RuntimeError> {
        loop {
            if self.halt.is_halted() {
                return Err(RuntimeError::Aborted);
            }
            let Some(instruction) = code.get(run.pc) else {
                return Ok(());
            };
            trace!("{:>5} {instruction}", run.pc);
            match self.step(run, instruction, code.len())? {
                Flow::Next => run.pc += 1,
                Flow::Jump(pc) => run.pc = pc,
                Flow::Import(path) => run.pc = self.import(run, &mut code, &path)?,
                Flow::Stop => return Ok(()),
            }
        }
    }

    /// Appends the unit at `path` once per run and enters it like a call.
    fn import(&mut self, run: &mut Run, code: &mut Bytecode, path: &str) -> Result<usize, RuntimeError> {
        let (canonical, unit) = self
            .units
            .load(Path::new(path), self.library)
            .map_err(|e| RuntimeError::Import {
                path: path.to_string(),
                source: Box::new(e),
            })?;
        if run.in_progress.contains(&canonical) {
            return Err(RuntimeError::ImportCycle(canonical));
        }
        let start = match run.appended.get(&canonical) {
            Some(&start) => start,
            None => {
                debug!("importing {}", canonical.display());
                let start = code.append(unit);
                run.appended.insert(canonical.clone(), start);
                start
            }
        };
        run.in_progress.insert(canonical.clone());
        run.frames.push(Frame {
            return_pc: run.pc + 1,
            arg_base: run.stack.len(),
            wants_value: false,
            return_value: Value::Null,
            unit: Some(canonical),
        });
        Ok(start)
    }

    fn step(&mut self, run: &mut Run, instruction: &Instruction, len: usize) -> Result<Flow, RuntimeError> {
        use Instruction::*;
        match instruction {
            Nop | Label(_) => {}
            Comment(line) => run.line = Some(line.clone()),
            BoxName(name) => {
                trace!("box `{name}`");
                run.box_name = Some(name.clone());
                run.line = None;
            }

            NewBox => run.rect = PageRect::default(),
            MoveBox(index) => run.move_box(*index)?,
            ReadBox(opts) => {
                run.rect.kind = opts.kind;
                run.rect.mode = opts.mode;
                let text = self.provider.get_text(&run.rect);
                run.views = vec![ContentView::new(text)];
            }
            NextTable => run.store.next_table(),

            Select(desc) => run.select(desc)?,
            SetVar(flags) => {
                let value = run.pop()?;
                let sel = run.pop_selector()?;
                run.store.set(&sel, value, *flags)?;
            }
            Clear => {
                let sel = run.pop_selector()?;
                run.store.clear(&sel);
            }
            PushVar => {
                let sel = run.pop_selector()?;
                run.stack.push(run.store.get(&sel));
            }
            IsSet => {
                let sel = run.pop_selector()?;
                run.stack.push(run.store.isset(&sel).into());
            }
            GetSize => {
                let sel = run.pop_selector()?;
                run.stack.push(count(run.store.size(&sel)));
            }

            PushView => {
                let text = run.view()?.view().to_string();
                run.stack.push(Value::String(text));
            }
            PushNull => run.stack.push(Value::Null),
            PushNum(n) => run.stack.push(Value::Number(*n)),
            PushStr(s) => run.stack.push(Value::String(s.clone())),
            PushArg(n) => {
                let value = run
                    .frames
                    .last()
                    .and_then(|f| run.stack.get(f.arg_base + usize::from(*n)))
                    .cloned()
                    .unwrap_or_default();
                run.stack.push(value);
            }
            Call(call) => {
                let function = self
                    .library
                    .get(&call.name)
                    .ok_or_else(|| RuntimeError::UnknownFunction(call.name.clone()))?;
                let argc = usize::from(call.argc);
                let base = run
                    .stack
                    .len()
                    .checked_sub(argc)
                    .ok_or(RuntimeError::StackUnderflow)?;
                let args = run.stack.split_off(base);
                let ctx = CallContext {
                    locale: &self.options.locale,
                };
                run.stack.push(function.call(args, &ctx)?);
            }
            Pop => {
                run.pop()?;
            }

            Add => run.binary(Value::add)?,
            Sub => run.binary(Value::sub)?,
            Mul => run.binary(Value::mul)?,
            Div => run.binary(Value::div)?,
            Eq => run.binary(|a, b| Ok(a.script_eq(b).into()))?,
            Neq => run.binary(|a, b| Ok((!a.script_eq(b)).into()))?,
            Lt => run.compare(|o| o.is_lt())?,
            Leq => run.compare(|o| o.is_le())?,
            Gt => run.compare(|o| o.is_gt())?,
            Geq => run.compare(|o| o.is_ge())?,
            And => run.binary(|a, b| Ok((a.as_bool() && b.as_bool()).into()))?,
            Or => run.binary(|a, b| Ok((a.as_bool() || b.as_bool()).into()))?,
            Not => {
                let value = run.pop()?;
                run.stack.push((!value.as_bool()).into());
            }
            Neg => {
                let value = run.pop()?;
                run.stack.push(value.neg()?);
            }

            PushContent => {
                let value = run.pop()?;
                run.views.push(ContentView::new(value.to_string()));
            }
            PopContent => {
                run.views.pop().ok_or(RuntimeError::NoContentView)?;
            }
            NewView => run.view()?.new_view(),
            NewSubview => run.view()?.new_subview(),
            ResetView => run.view()?.reset_view(),
            NextResult => run.view()?.next_result(),
            SetBegin => {
                let n = run.pop_index()?;
                run.view()?.setbegin(n);
            }
            SetEnd => {
                let n = run.pop_index()?;
                run.view()?.setend(n);
            }

            ThrowError => {
                let message = run.pop()?;
                return Err(RuntimeError::Script(message.to_string()));
            }
            Warning => {
                let message = run.pop()?.to_string();
                debug!("warning: {message}");
                run.warnings.push(message);
            }

            Jmp(target) => return run.jump(target, len),
            Jz(target) => {
                if !run.pop()?.as_bool() {
                    return run.jump(target, len);
                }
            }
            Jnz(target) => {
                if run.pop()?.as_bool() {
                    return run.jump(target, len);
                }
            }
            Jte(target) => {
                if run.view()?.token_end() {
                    return run.jump(target, len);
                }
            }
            CallSub(call) => {
                let flow = run.jump(&call.target, len)?;
                let arg_base = run
                    .stack
                    .len()
                    .checked_sub(usize::from(call.argc))
                    .ok_or(RuntimeError::StackUnderflow)?;
                run.frames.push(Frame {
                    return_pc: run.pc + 1,
                    arg_base,
                    wants_value: call.value,
                    return_value: Value::Null,
                    unit: None,
                });
                return Ok(flow);
            }
            SetRetVal => {
                let value = run.pop()?;
                if let Some(frame) = run.frames.last_mut() {
                    frame.return_value = value;
                }
            }
            Ret => {
                let Some(frame) = run.frames.pop() else {
                    return Ok(Flow::Stop);
                };
                run.stack.truncate(frame.arg_base);
                if frame.wants_value {
                    run.stack.push(frame.return_value);
                }
                if let Some(unit) = frame.unit {
                    run.in_progress.remove(&unit);
                }
                return Ok(Flow::Jump(frame.return_pc));
            }
            Import(path) => return Ok(Flow::Import(path.clone())),
            AddLayout(path) => {
                if run.frames.is_empty() {
                    if let Ok(canonical) = LoadedUnits::canonical(Path::new(path)) {
                        run.in_progress.insert(canonical);
                    }
                }
                run.layouts.push(path.clone());
            }
            FoundLayout => {
                if self.options.find_layout {
                    debug!("layout found: {}", run.layouts.last().map_or("", String::as_str));
                    return Ok(Flow::Stop);
                }
            }
            Halt => return Ok(Flow::Stop),
        }
        Ok(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PlainTextDocument;
    use crate::model::{BoxKind, LayoutBox, LayoutBoxList};
    use crate::processor::script_parser::{CompileOptions, compile};

    fn run_with(text: &str, boxes: Vec<LayoutBox>, locale: Locale) -> Result<ReaderOutput, ReaderError> {
        let library = FunctionLibrary::new();
        let code = compile(
            Path::new("mem"),
            &LayoutBoxList::new(boxes),
            &library,
            CompileOptions { debug: true },
        )
        .unwrap();
        let mut units = LoadedUnits::default();
        let mut reader = Reader::new(
            &library,
            &mut units,
            PlainTextDocument::new(text),
            ReaderOptions { locale, ..ReaderOptions::default() },
        );
        reader.exec(code)
    }

    fn page_box(script: &str) -> LayoutBox {
        LayoutBox {
            name: "page".into(),
            kind: BoxKind::Page,
            script: script.into(),
            ..LayoutBox::default()
        }
    }

    fn run(text: &str, script: &str) -> ReaderOutput {
        run_with(text, vec![page_box(script)], Locale::default()).unwrap()
    }

    fn var(out: &ReaderOutput, name: &str) -> Vec<String> {
        out.values[0]
            .get(name)
            .map(|v| v.iter().map(Value::to_string).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_foreach_collects_lines() {
        let out = run("a\nb\n\nc", "$foreach { items[] = @; }");
        assert_eq!(var(&out, "items"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_between_narrows_view() {
        let out = run("Total: 12.50 EUR", "$between(\"Total:\", \"EUR\") x = $trim(@);");
        assert_eq!(var(&out, "x"), vec!["Total: 12.50"]);
        let out = run("head [body] tail", "$between(\"[\") x = @;");
        assert_eq!(var(&out, "x"), vec!["[body] tail"]);
    }

    #[test]
    fn test_step_and_with() {
        let out = run("", "$with(\"a\\nb\\nc\") $step { x = @; y = @; }");
        assert_eq!(var(&out, "x"), vec!["a"]);
        assert_eq!(var(&out, "y"), vec!["b"]);
    }

    #[test]
    fn test_setbegin_setend() {
        let out = run("0123456789", "$newview { $setbegin(2); $setend(3); x = @; } y = @;");
        assert_eq!(var(&out, "x"), vec!["234"]);
        assert_eq!(var(&out, "y"), vec!["0123456789"]);
    }

    #[test]
    fn test_subroutines() {
        let out = run(
            "",
            "$function(add3, 3) return($arg(0) + $arg(1) + $arg(2)); x = $add3(1, 2, 3) * 2; $function(w) $warning(\"w\"); $call(w);",
        );
        assert_eq!(var(&out, "x"), vec!["12"]);
        assert_eq!(out.warnings, vec!["w"]);
    }

    #[test]
    fn test_error_is_fatal_and_annotated() {
        let err = run_with("total", vec![page_box("x = 1;\n$error(\"bad \" + @);")], Locale::default())
            .unwrap_err();
        assert!(matches!(&err.source, RuntimeError::Script(m) if m == "bad total"));
        assert_eq!(err.box_name.as_deref(), Some("page"));
        assert_eq!(err.line.as_deref(), Some("$error(\"bad \" + @);"));
    }

    #[test]
    fn test_tables_and_globals() {
        let out = run("", "x = 1; *g = \"a\"; $nexttable(); x = 2;");
        assert_eq!(out.values.len(), 2);
        assert_eq!(var(&out, "x"), vec!["1"]);
        assert_eq!(out.values[1]["x"], vec![Value::from(2)]);
        assert_eq!(out.globals["g"], vec![Value::from("a")]);
        assert_eq!(out.layouts, vec!["mem"]);
    }

    #[test]
    fn test_rectangle_geometry_and_spacers() {
        let text = "aaaa\nbbbb\ncccc\ndddd";
        let rect = LayoutBox {
            name: "r".into(),
            kind: BoxKind::Rectangle,
            page: 1,
            x: 0.0,
            y: 0.0,
            w: 1.0,
            h: 0.25,
            spacers: "top + 0.5".into(),
            script: "x = @;".into(),
            ..LayoutBox::default()
        };
        let out = run_with(text, vec![rect], Locale::default()).unwrap();
        // moving the top edge shrinks the height, leaving an empty band
        assert_eq!(var(&out, "x"), Vec::<String>::new());

        let rect = LayoutBox {
            name: "r".into(),
            kind: BoxKind::Rectangle,
            page: 1,
            w: 1.0,
            h: 0.25,
            spacers: "y + 0.5".into(),
            script: "x = @;".into(),
            ..LayoutBox::default()
        };
        let out = run_with(text, vec![rect], Locale::default()).unwrap();
        assert_eq!(var(&out, "x"), vec!["cccc"]);
    }

    #[test]
    fn test_halt_handle_aborts() {
        let library = FunctionLibrary::new();
        let code = compile(
            Path::new("mem"),
            &LayoutBoxList::new(vec![LayoutBox {
                kind: BoxKind::NoRead,
                script: "while (1) x++;".into(),
                ..LayoutBox::default()
            }]),
            &library,
            CompileOptions::default(),
        )
        .unwrap();
        let mut units = LoadedUnits::default();
        let mut reader = Reader::new(
            &library,
            &mut units,
            PlainTextDocument::default(),
            ReaderOptions::default(),
        );
        let handle = reader.halt_handle();
        assert_eq!(reader.state(), State::Idle);
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            handle.halt();
        });
        let err = reader.exec(code).unwrap_err();
        stopper.join().unwrap();
        assert!(matches!(err.source, RuntimeError::Aborted));
        assert_eq!(reader.state(), State::Halted);
    }
}
