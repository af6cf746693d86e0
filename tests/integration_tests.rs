//! Integration tests for Stencil.
//!
//! These tests verify the end-to-end pipeline: module resolution,
//! multi-pass rendering, block preservation, argument resolution and
//! lockfile production. Projects are built from in-memory replacement
//! modules so no network or git binary is required.

use std::path::Path;
use stencil::{ModuleFilesystem, RenderOptions, Stencil};
use tempfile::TempDir;

/// Create a project directory with the given manifest contents.
fn project_dir(manifest: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("stencil.yaml"), manifest).unwrap();
    dir
}

/// Shorthand for an in-memory module with a manifest and template files.
fn memory_module(name: &str, manifest_extra: &str, files: &[(&str, &str)]) -> ModuleFilesystem {
    let mut fs = ModuleFilesystem::memory()
        .with_file("manifest.yaml", format!("name: {name}\n{manifest_extra}"));
    for (path, contents) in files {
        fs = fs.with_file(path, *contents);
    }
    fs
}

fn read(dir: &Path, rel: &str) -> String {
    std::fs::read_to_string(dir.join(rel)).unwrap()
}

mod render_tests {
    use super::*;

    #[tokio::test]
    async fn test_single_file_render() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let stencil = Stencil::new(dir.path()).with_in_memory_module(
            "testing",
            memory_module("testing", "", &[("templates/virtual-file.tpl", "hello world!")]),
        );

        let run = stencil.run().await.unwrap();

        assert_eq!(run.written, vec!["virtual-file"]);
        assert_eq!(read(dir.path(), "virtual-file"), "hello world!");
    }

    #[tokio::test]
    async fn test_multi_file_via_file_create() {
        let dir = project_dir(
            "name: testing\nmodules:\n  - name: testing\narguments:\n  commands:\n    - hello\n    - world\n    - command\n",
        );
        let template = "\
{%- for command in stencil.Arg(\"commands\") -%}
{{ file.Create(command) }}{{ file.SetContents(command) }}
{%- endfor -%}";
        let stencil = Stencil::new(dir.path()).with_in_memory_module(
            "testing",
            memory_module(
                "testing",
                "arguments:\n  commands:\n    schema:\n      type: array\n",
                &[("templates/commands.tpl", template)],
            ),
        );

        let run = stencil.run().await.unwrap();

        let mut written = run.written.clone();
        written.sort();
        assert_eq!(written, vec!["command", "hello", "world"]);
        assert_eq!(read(dir.path(), "hello"), "hello");
        assert_eq!(read(dir.path(), "command"), "command");
    }

    #[tokio::test]
    async fn test_module_hook_fixed_point() {
        // Module A appends to a hook owned by module B; B renders the
        // hook's contents. Whatever order the shuffled discovery picks,
        // the final pass must observe the complete multiset.
        let dir = project_dir("name: testing\nmodules:\n  - name: writer\n  - name: reader\n");
        let writer = memory_module(
            "writer",
            "modules:\n  - name: reader\n",
            &[(
                "templates/side-effects.library.tpl",
                "{{ stencil.AddToModuleHook(\"reader\", \"greetings\", \"hello\", \"world\") }}",
            )],
        );
        let reader = memory_module(
            "reader",
            "moduleHooks:\n  greetings: {}\n",
            &[(
                "templates/greetings.txt.tpl",
                "count: {{ stencil.GetModuleHook(\"greetings\") | length }}",
            )],
        );

        let run = Stencil::new(dir.path())
            .with_in_memory_module("writer", writer)
            .with_in_memory_module("reader", reader)
            .run()
            .await
            .unwrap();

        assert_eq!(run.written, vec!["greetings.txt"]);
        assert_eq!(read(dir.path(), "greetings.txt"), "count: 2");
    }

    #[tokio::test]
    async fn test_unstable_state_hits_iteration_cap() {
        // A global that grows every pass can never reach a fixed point.
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let err = Stencil::new(dir.path())
            .with_options(RenderOptions { max_iterations: 3, ..RenderOptions::default() })
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "",
                    &[(
                        "templates/counter.tpl",
                        "{{ stencil.SetGlobal(\"n\", (stencil.GetGlobal(\"n\") or 0) + 1) }}",
                    )],
                ),
            )
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, stencil::StencilError::UnstableSharedState { iterations: 3 }));
    }

    #[tokio::test]
    async fn test_block_preservation() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        std::fs::write(
            dir.path().join("service.yaml"),
            "## <<Stencil::Block(version)>>\n  version: xyz\n## <</Stencil::Block>>\n",
        )
        .unwrap();

        let template = "\
## <<Stencil::Block(version)>>
{% if file.Block(\"version\") %}{{ file.Block(\"version\") }}{% else %}  version: latest{% endif %}
## <</Stencil::Block>>
";
        let stencil = Stencil::new(dir.path()).with_in_memory_module(
            "testing",
            memory_module("testing", "", &[("templates/service.yaml.tpl", template)]),
        );

        stencil.run().await.unwrap();

        let rendered = read(dir.path(), "service.yaml");
        assert!(rendered.contains("  version: xyz"), "{rendered}");
        assert!(!rendered.contains("version: latest"), "{rendered}");
    }

    #[tokio::test]
    async fn test_block_round_trip_across_renders() {
        // A second render over the first render's output must preserve
        // the block contents byte for byte.
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let template = "\
before
## <<Stencil::Block(custom)>>
{{ file.Block(\"custom\") }}
## <</Stencil::Block>>
after
";
        let module = memory_module("testing", "", &[("templates/out.txt.tpl", template)]);

        let stencil =
            Stencil::new(dir.path()).with_in_memory_module("testing", module.clone());
        stencil.run().await.unwrap();

        // Seed the block with a user edit, then re-render twice.
        let edited = read(dir.path(), "out.txt").replace(
            "## <<Stencil::Block(custom)>>\n\n",
            "## <<Stencil::Block(custom)>>\nuser edit\n",
        );
        std::fs::write(dir.path().join("out.txt"), &edited).unwrap();

        for _ in 0..2 {
            Stencil::new(dir.path())
                .with_in_memory_module("testing", module.clone())
                .run()
                .await
                .unwrap();
            let rendered = read(dir.path(), "out.txt");
            assert!(rendered.contains("user edit"), "{rendered}");
        }
    }

    #[tokio::test]
    async fn test_library_templates_emit_no_files() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "",
                    &[
                        ("templates/helpers.library.tpl", "{{ stencil.SetGlobal(\"x\", 1) }}"),
                        ("templates/out.tpl", "x = {{ stencil.GetGlobal(\"x\") }}"),
                    ],
                ),
            )
            .run()
            .await
            .unwrap();

        assert_eq!(run.written, vec!["out"]);
        assert_eq!(read(dir.path(), "out"), "x = 1");
    }

    #[tokio::test]
    async fn test_binary_templates_copy_verbatim() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "",
                    &[("templates/logo.png.nontpl", "{{ not a template }}")],
                ),
            )
            .run()
            .await
            .unwrap();

        assert_eq!(run.written, vec!["logo.png"]);
        assert_eq!(read(dir.path(), "logo.png"), "{{ not a template }}");
    }

    #[tokio::test]
    async fn test_exported_function_call() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let library = "\
{%- if data -%}
{{ return(\"hello \" ~ data) }}
{%- endif -%}
{{ module.Export(\"Greet\") }}";
        let caller = "{{ module.Call(\"testing.Greet\", \"world\") }}";

        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "",
                    &[
                        ("templates/greet.library.tpl", library),
                        ("templates/out.tpl", caller),
                    ],
                ),
            )
            .run()
            .await
            .unwrap();

        assert_eq!(run.written, vec!["out"]);
        assert_eq!(read(dir.path(), "out"), "hello world");
    }

    #[tokio::test]
    async fn test_read_blocks_from_module_file() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let snippet = "\
## <<Stencil::Block(version)>>
1.2.3
## <</Stencil::Block>>
";
        let template = "present={{ stencil.ReadBlocks(\"snippets/defaults.yaml\")[\"version\"] }} missing={{ stencil.ReadBlocks(\"snippets/absent.yaml\") | length }}";

        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "",
                    &[
                        ("snippets/defaults.yaml", snippet),
                        ("templates/out.tpl", template),
                    ],
                ),
            )
            .run()
            .await
            .unwrap();

        assert_eq!(run.written, vec!["out"]);
        // A missing file yields an empty block map, not an error.
        assert_eq!(read(dir.path(), "out"), "present=1.2.3 missing=0");
    }

    #[tokio::test]
    async fn test_dir_replacements_rewrite_output_paths() {
        let dir = project_dir(
            "name: testing\nmodules:\n  - name: testing\narguments:\n  serviceName: my-service\n",
        );
        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "arguments:\n  serviceName:\n    schema:\n      type: string\ndirReplacements:\n  appname: '{{ stencil.Arg(\"serviceName\") }}'\n",
                    &[("templates/cmd/appname/main.go.tpl", "package main")],
                ),
            )
            .run()
            .await
            .unwrap();

        assert_eq!(run.written, vec!["cmd/my-service/main.go"]);
    }
}

mod resolution_tests {
    use super::*;

    #[tokio::test]
    async fn test_constraint_conflict_diagnosis() {
        // Two modules want github.com/example/base at >=0.5.0 and
        // ~0.3.0; the failure names both parents in a tree layout.
        let module_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            module_dir.path().join("manifest.yaml"),
            "name: nested_constraint\nmodules:\n  - name: github.com/example/base\n    version: \"~0.3.0\"\n",
        )
        .unwrap();

        let manifest = format!(
            "name: testing\nmodules:\n  - name: github.com/example/base\n    version: \">=0.5.0\"\n  - name: nested_constraint\nreplacements:\n  nested_constraint: {}\n",
            module_dir.path().display()
        );
        let dir = project_dir(&manifest);

        let remote = std::sync::Arc::new(
            stencil::vcs::StaticRemote::new()
                .with_refs("https://github.com/example/base", &["v0.3.4", "v0.5.0"]),
        );
        // The first resolution (before the nested want arrives) needs a
        // fetchable tree for v0.5.0.
        std::fs::create_dir_all(module_dir.path().join("base")).unwrap();
        std::fs::write(
            module_dir.path().join("base/manifest.yaml"),
            "name: github.com/example/base",
        )
        .unwrap();
        let fetcher = std::sync::Arc::new(stencil::vcs::StaticRemote::new().with_tree(
            "https://github.com/example/base",
            "v0.5.0",
            module_dir.path().join("base"),
        ));

        let err = Stencil::new(dir.path())
            .with_collaborators(remote, fetcher)
            .run()
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("testing (top-level) wants >=0.5.0"), "{message}");
        assert!(
            message.contains("nested_constraint@virtual (source: local) wants ~0.3.0"),
            "{message}"
        );
    }

    #[tokio::test]
    async fn test_resolve_without_rendering() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let stencil = Stencil::new(dir.path()).with_in_memory_module(
            "testing",
            memory_module("testing", "", &[("templates/a.tpl", "a")]),
        );

        let (project, modules) = stencil.resolve().await.unwrap();
        assert_eq!(project.name, "testing");
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].version.to_string(), "virtual");
    }
}

mod argument_tests {
    use super::*;

    #[tokio::test]
    async fn test_from_indirection() {
        let dir = project_dir(
            "name: testing\nmodules:\n  - name: provider\n  - name: consumer\narguments:\n  name: x\n",
        );
        let provider = memory_module(
            "provider",
            "arguments:\n  name:\n    schema:\n      type: string\n",
            &[],
        );
        let consumer = memory_module(
            "consumer",
            "modules:\n  - name: provider\narguments:\n  name:\n    from: provider\n",
            &[("templates/out.tpl", "name: {{ stencil.Arg(\"name\") }}")],
        );

        let run = Stencil::new(dir.path())
            .with_in_memory_module("provider", provider)
            .with_in_memory_module("consumer", consumer)
            .run()
            .await
            .unwrap();

        assert_eq!(run.written, vec!["out"]);
        assert_eq!(read(dir.path(), "out"), "name: x");
    }

    #[tokio::test]
    async fn test_from_indirection_validates_against_origin_schema() {
        let dir = project_dir(
            "name: testing\nmodules:\n  - name: provider\n  - name: consumer\narguments:\n  name: 123\n",
        );
        let provider = memory_module(
            "provider",
            "arguments:\n  name:\n    schema:\n      type: string\n",
            &[],
        );
        let consumer = memory_module(
            "consumer",
            "modules:\n  - name: provider\narguments:\n  name:\n    from: provider\n",
            &[("templates/out.tpl", "name: {{ stencil.Arg(\"name\") }}")],
        );

        let err = Stencil::new(dir.path())
            .with_in_memory_module("provider", provider)
            .with_in_memory_module("consumer", consumer)
            .run()
            .await
            .unwrap_err();

        assert!(err.to_string().contains("provider.arguments.name"), "{err}");
    }

    #[tokio::test]
    async fn test_defaults_and_zero_values() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "arguments:\n  replicas:\n    default: 2\n  teamName:\n    schema:\n      type: string\n",
                    &[(
                        "templates/out.tpl",
                        "replicas={{ stencil.Arg(\"replicas\") }} team='{{ stencil.Arg(\"teamName\") }}'",
                    )],
                ),
            )
            .run()
            .await
            .unwrap();

        assert_eq!(run.written, vec!["out"]);
        assert_eq!(read(dir.path(), "out"), "replicas=2 team=''");
    }
}

mod file_ops_tests {
    use super::*;

    #[tokio::test]
    async fn test_once_skips_when_target_exists() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        std::fs::write(dir.path().join("README.md"), "user owned\n").unwrap();

        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "",
                    &[("templates/README.md.tpl", "{{ file.Once() }}generated")],
                ),
            )
            .run()
            .await
            .unwrap();

        assert!(run.written.is_empty());
        assert_eq!(read(dir.path(), "README.md"), "user owned\n");
    }

    #[tokio::test]
    async fn test_delete_removes_target_and_lockfile_entry() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        std::fs::write(dir.path().join("obsolete.txt"), "old").unwrap();

        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "",
                    &[("templates/obsolete.txt.tpl", "{{ file.Delete() }}")],
                ),
            )
            .run()
            .await
            .unwrap();

        assert_eq!(run.removed, vec!["obsolete.txt"]);
        assert!(!dir.path().join("obsolete.txt").exists());
        assert!(!run.lockfile.files.iter().any(|f| f.name == "obsolete.txt"));
    }

    #[tokio::test]
    async fn test_skip_leaves_target_untouched() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "",
                    &[("templates/opt.txt.tpl", "{{ file.Skip(\"not wanted\") }}body")],
                ),
            )
            .run()
            .await
            .unwrap();

        assert!(run.written.is_empty());
        assert!(!dir.path().join("opt.txt").exists());
    }

    #[tokio::test]
    async fn test_adoption_wraps_existing_content() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        // Hand-written file with no markers.
        std::fs::write(
            dir.path().join("config.yaml"),
            "header: one\ncustom: user-value\nfooter: two\n",
        )
        .unwrap();

        let template = "\
header: one
## <<Stencil::Block(custom)>>
{{ file.Block(\"custom\") }}
## <</Stencil::Block>>
footer: two
";
        let stencil = Stencil::new(dir.path())
            .with_options(RenderOptions { adopt: true, ..RenderOptions::default() })
            .with_in_memory_module(
                "testing",
                memory_module("testing", "", &[("templates/config.yaml.tpl", template)]),
            );

        stencil.run().await.unwrap();

        let rendered = read(dir.path(), "config.yaml");
        assert!(rendered.contains("custom: user-value"), "{rendered}");
        assert!(rendered.contains("<<Stencil::Block(custom)>>"), "{rendered}");
    }
}

mod lockfile_tests {
    use super::*;

    #[tokio::test]
    async fn test_lockfile_records_modules_and_files() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "",
                    &[("templates/b.txt.tpl", "b"), ("templates/a.txt.tpl", "a")],
                ),
            )
            .run()
            .await
            .unwrap();

        assert_eq!(run.lockfile.modules.len(), 1);
        assert_eq!(run.lockfile.modules[0].name, "testing");
        assert_eq!(run.lockfile.modules[0].version, "virtual");
        assert_eq!(run.lockfile.files.len(), 2);

        // Written sorted regardless of discovery shuffle.
        let on_disk = read(dir.path(), "stencil.lock");
        let a = on_disk.find("name: a.txt").unwrap();
        let b = on_disk.find("name: b.txt").unwrap();
        assert!(a < b, "{on_disk}");
    }

    #[tokio::test]
    async fn test_post_run_commands_surface_on_result() {
        let dir = project_dir("name: testing\nmodules:\n  - name: testing\n");
        let run = Stencil::new(dir.path())
            .with_in_memory_module(
                "testing",
                memory_module(
                    "testing",
                    "postRunCommand:\n  - name: format\n    command: make fmt\n",
                    &[("templates/a.tpl", "a")],
                ),
            )
            .run()
            .await
            .unwrap();

        assert_eq!(run.post_run_commands.len(), 1);
        assert_eq!(run.post_run_commands[0].command, "make fmt");
    }
}
